use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::messages::Message;

/// Resolve a requested file against the repository's `.git` directory and
/// enforce the serving allow-list: `info/refs`, `HEAD`, and anything under
/// `objects/`. Everything else is refused, notably `config`, which may
/// leak remote URLs. Canonicalisation defeats `..` traversal and symlink
/// escapes.
pub fn resolve(repo: &Path, file: &str) -> io::Result<PathBuf> {
    let base = repo.join(".git").canonicalize()?;
    let full = base.join(file).canonicalize()?;

    if !full.starts_with(&base) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("directory traversal attempt thwarted: {}", file),
        ));
    }

    let allowed = full == base.join("info/refs")
        || full == base.join("HEAD")
        || full.strip_prefix(&base)
            .map(|rest| rest.starts_with("objects"))
            .unwrap_or(false);

    if !allowed || !full.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("rejecting filename: {}", file),
        ));
    }

    Ok(full)
}

/// State for one file being served to the remote peer: a window of up to
/// `window` unacknowledged chunks is kept in flight, and chunk numbers
/// start at 1. End of file is signalled by an empty chunk.
#[derive(Debug)]
pub struct FileSend {
    id: i64,
    fd: File,
    chunk_size: usize,
    window: u64,
    /// Highest chunk number sent.
    sent: i64,
    /// Highest chunk number acknowledged.
    ack: i64,
    eof: bool,
}

/// What a received ack caused: possibly more chunks to put on the wire,
/// and whether the transfer is complete.
#[derive(Debug, Default)]
pub struct AckResult {
    pub messages: Vec<Message>,
    pub done: bool,
}

impl FileSend {
    pub fn open(
        repo: &Path,
        file: &str,
        id: i64,
        chunk_size: usize,
        window: u64,
    ) -> io::Result<FileSend> {
        let path = resolve(repo, file)?;
        Ok(FileSend {
            id,
            fd: File::open(path)?,
            chunk_size,
            window,
            sent: 0,
            ack: -1,
            eof: false,
        })
    }

    /// Process one acknowledgement from the remote peer. The transfer is
    /// seeded by acking chunk 0 right after open. When the remote has
    /// caught up, the next window of chunks is read and queued; an empty
    /// read marks end of file.
    pub fn on_ack(&mut self, ack: i64) -> Result<AckResult> {
        if !(self.ack < ack && ack <= self.sent) {
            return Err(Error::protocol(format!(
                "file_ack chunk {} outside window ({}..={}]",
                ack, self.ack, self.sent
            )));
        }
        self.ack = ack;

        let mut result = AckResult::default();

        // Remote hasn't caught up to the window edge yet.
        if self.ack < self.sent {
            return Ok(result);
        }

        if self.eof {
            result.done = true;
            return Ok(result);
        }

        for _ in 0..self.window {
            let mut buf = vec![0u8; self.chunk_size];
            let n = self.fd.read(&mut buf)?;
            buf.truncate(n);

            self.sent += 1;
            let at_eof = buf.is_empty();
            result.messages.push(Message::FileDat {
                id: self.id,
                chunk: self.sent,
                buf,
            });
            if at_eof {
                self.eof = true;
                break;
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir_all(git.join("info")).unwrap();
        fs::create_dir_all(git.join("objects/aa")).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(git.join("info/refs"), "1111 refs/heads/main\n").unwrap();
        fs::write(git.join("objects/aa/bbcc"), b"blob").unwrap();
        fs::write(git.join("config"), "[remote \"origin\"]\n").unwrap();
        fs::write(dir.path().join("README"), "hello\n").unwrap();
        dir
    }

    #[test]
    fn allow_list() {
        let repo = fake_repo();
        assert!(resolve(repo.path(), "HEAD").is_ok());
        assert!(resolve(repo.path(), "info/refs").is_ok());
        assert!(resolve(repo.path(), "objects/aa/bbcc").is_ok());

        assert!(resolve(repo.path(), "config").is_err());
        assert!(resolve(repo.path(), "info").is_err());
        assert!(resolve(repo.path(), "objects").is_err());
        assert!(resolve(repo.path(), "nonexistent").is_err());
    }

    #[test]
    fn traversal_rejected() {
        let repo = fake_repo();
        assert!(resolve(repo.path(), "../README").is_err());
        assert!(resolve(repo.path(), "objects/../../README").is_err());
        assert!(resolve(repo.path(), "../../../../etc/passwd").is_err());
    }

    #[test]
    fn small_file_walk() {
        let repo = fake_repo();
        let mut send = FileSend::open(repo.path(), "HEAD", 9, 1024, 5).unwrap();

        // Seeding ack 0 fills the window: the whole file as chunk 1, then
        // the empty end-of-file marker as chunk 2.
        let first = send.on_ack(0).unwrap();
        assert!(!first.done);
        assert_eq!(first.messages.len(), 2);
        assert_eq!(
            first.messages[0],
            Message::FileDat {
                id: 9,
                chunk: 1,
                buf: b"ref: refs/heads/main\n".to_vec(),
            }
        );
        assert_eq!(
            first.messages[1],
            Message::FileDat {
                id: 9,
                chunk: 2,
                buf: vec![],
            }
        );

        let mid = send.on_ack(1).unwrap();
        assert!(!mid.done);
        assert!(mid.messages.is_empty());

        let last = send.on_ack(2).unwrap();
        assert!(last.done);
        assert!(last.messages.is_empty());
    }

    #[test]
    fn window_caps_chunks_in_flight() {
        let repo = fake_repo();
        let big: Vec<u8> = (0..100u8).cycle().take(1000).collect();
        fs::write(repo.path().join(".git/objects/aa/big"), &big).unwrap();

        let mut send = FileSend::open(repo.path(), "objects/aa/big", 0, 100, 3).unwrap();

        let first = send.on_ack(0).unwrap();
        assert_eq!(first.messages.len(), 3);

        // Acking only part of the window sends nothing new.
        assert!(send.on_ack(1).unwrap().messages.is_empty());
        assert!(send.on_ack(2).unwrap().messages.is_empty());

        // Catching up to the window edge releases the next batch.
        let next = send.on_ack(3).unwrap();
        assert_eq!(next.messages.len(), 3);
        match &next.messages[0] {
            Message::FileDat { chunk, buf, .. } => {
                assert_eq!(*chunk, 4);
                assert_eq!(buf.len(), 100);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn out_of_range_ack_is_protocol_error() {
        let repo = fake_repo();
        let mut send = FileSend::open(repo.path(), "HEAD", 0, 1024, 5).unwrap();
        send.on_ack(0).unwrap();

        // Repeating an old ack and acking beyond the window edge both fail.
        assert!(send.on_ack(0).is_err());
        assert!(send.on_ack(99).is_err());
    }
}
