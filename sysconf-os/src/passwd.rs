//! The GECOS (comment) field of an account in a passwd(5) file.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::{wait::WaitMonitor, OsError};

/// Index of the GECOS field in a passwd line.
const GECOS_FIELD: usize = 4;
/// Number of fields in a well-formed passwd line.
const FIELD_COUNT: usize = 7;

pub(crate) struct PasswdFile {
    path: PathBuf,
}

impl PasswdFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        PasswdFile { path: path.into() }
    }

    pub(crate) fn gecos(&self, user: &str) -> Result<String, OsError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| OsError::io(format!("reading {}", self.path.display()), e))?;
        find_gecos(&contents, user)
            .map(|s| s.to_string())
            .ok_or_else(|| self.no_account(user))
    }

    /// Rewrite the file with a new GECOS field for `user`.
    ///
    /// The previous file is kept as `<path>.bak`, and the new contents replace
    /// the file atomically. Writers coordinate through `.pwd.lock` in the
    /// same directory, like the shadow utilities do.
    pub(crate) fn set_gecos(&self, user: &str, gecos: &str) -> Result<(), OsError> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let lock_path = dir.join(".pwd.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| OsError::io(format!("opening {}", lock_path.display()), e))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let guard = {
            let monitor = WaitMonitor::new(format!("Waiting for {}", lock_path.display()));
            let guard = lock
                .write()
                .map_err(|e| OsError::io(format!("locking {}", lock_path.display()), e))?;
            monitor.done();
            guard
        };

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| OsError::io(format!("reading {}", self.path.display()), e))?;
        let new_contents =
            replace_gecos(&contents, user, gecos).ok_or_else(|| self.no_account(user))?;
        if new_contents == contents {
            return Ok(());
        }

        let permissions = fs::metadata(&self.path)
            .map_err(|e| OsError::io(format!("inspecting {}", self.path.display()), e))?
            .permissions();
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| OsError::io(format!("creating temporary file in {}", dir.display()), e))?;
        tmp.write_all(new_contents.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| OsError::io(format!("writing {}", tmp.path().display()), e))?;
        fs::set_permissions(tmp.path(), permissions)
            .map_err(|e| OsError::io(format!("setting mode of {}", tmp.path().display()), e))?;

        let backup = backup_path(&self.path);
        fs::copy(&self.path, &backup)
            .map_err(|e| OsError::io(format!("backing up to {}", backup.display()), e))?;
        tmp.persist(&self.path)
            .map_err(|e| OsError::io(format!("replacing {}", self.path.display()), e.error))?;

        drop(guard);
        Ok(())
    }

    fn no_account(&self, user: &str) -> OsError {
        OsError::OsRejected(format!(
            "no account named {} in {}",
            user,
            self.path.display()
        ))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

fn find_gecos<'a>(contents: &'a str, user: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= FIELD_COUNT && fields[0] == user {
            Some(fields[GECOS_FIELD])
        } else {
            None
        }
    })
}

/// Returns `None` if `user` has no entry.
fn replace_gecos(contents: &str, user: &str, gecos: &str) -> Option<String> {
    let mut found = false;
    let mut out = String::with_capacity(contents.len() + gecos.len());
    for line in contents.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let mut fields: Vec<&str> = body.split(':').collect();
        if !found && fields.len() >= FIELD_COUNT && fields[0] == user {
            found = true;
            fields[GECOS_FIELD] = gecos;
            out.push_str(&fields.join(":"));
            out.push_str(newline);
        } else {
            out.push_str(line);
        }
    }
    found.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                          # a comment\n\
                          alice:x:1000:1000:Alice,,,:/home/alice:/bin/sh\n";

    #[test]
    fn test_find_gecos() {
        assert_eq!(find_gecos(PASSWD, "root"), Some("root"));
        assert_eq!(find_gecos(PASSWD, "alice"), Some("Alice,,,"));
        assert_eq!(find_gecos(PASSWD, "bob"), None);
    }

    #[test]
    fn test_replace_gecos_touches_only_the_account() {
        let out = replace_gecos(PASSWD, "root", "test_contact").unwrap();
        assert_eq!(
            out,
            "root:x:0:0:test_contact:/root:/bin/bash\n\
             daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
             # a comment\n\
             alice:x:1000:1000:Alice,,,:/home/alice:/bin/sh\n"
        );
        assert!(replace_gecos(PASSWD, "bob", "x").is_none());
    }

    #[test]
    fn test_replace_gecos_without_trailing_newline() {
        let out = replace_gecos("root:x:0:0::/root:/bin/sh", "root", "ops").unwrap();
        assert_eq!(out, "root:x:0:0:ops:/root:/bin/sh");
    }

    #[test]
    fn test_set_gecos_replaces_file_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        fs::write(&path, PASSWD).unwrap();
        let file = PasswdFile::new(&path);

        file.set_gecos("root", "test_contact").unwrap();
        assert_eq!(file.gecos("root").unwrap(), "test_contact");
        assert_eq!(file.gecos("alice").unwrap(), "Alice,,,");
        assert_eq!(
            fs::read_to_string(dir.path().join("passwd.bak")).unwrap(),
            PASSWD
        );

        // Setting the same value again is not an error
        file.set_gecos("root", "test_contact").unwrap();
        assert_eq!(file.gecos("root").unwrap(), "test_contact");
    }

    #[test]
    fn test_set_gecos_unknown_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        fs::write(&path, PASSWD).unwrap();
        let r = PasswdFile::new(&path).set_gecos("bob", "x");
        assert!(matches!(r, Err(OsError::OsRejected(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), PASSWD);
    }
}
