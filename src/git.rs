use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::warn;

use crate::error::{Error, Result};

/// Narrow facade over the external `git` binary. Long-running transfers
/// (clone/fetch/merge) are supervised elsewhere; everything here is a
/// short probe whose output we parse.
#[derive(Debug)]
pub struct Git {
    directory: PathBuf,
    /// The root commit: first commit of the repository, no parents. This
    /// is the swarm id.
    pub root: Option<String>,
}

impl Git {
    pub fn open(directory: &Path) -> Result<Git> {
        if !directory.join(".git").is_dir() {
            return Err(Error::Git(format!(
                "{} is not a top-level git project",
                directory.display()
            )));
        }

        let mut git = Git {
            directory: directory.to_path_buf(),
            root: None,
        };
        git.root = git.find_root()?;
        Ok(git)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.directory)
            .args(args)
            .output()?;

        if !output.status.success() {
            return Err(Error::Git(format!(
                "git {} returned {}",
                args.first().unwrap_or(&""),
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn find_root(&self) -> Result<Option<String>> {
        let history = self.run(&["log", "--pretty=%H %P"])?;
        let (root, extra) = root_from_history(&history);
        if extra {
            warn!(
                "more than one root commit in {}, selecting {:?}",
                self.directory.display(),
                root
            );
        }
        Ok(root)
    }

    /// Refresh the static files served to the dumb transfer protocol
    /// (`info/refs` and friends under `.git`).
    pub fn update_server_info(&self) -> Result<()> {
        self.run(&["update-server-info"]).map(|_| ())
    }

    pub fn remotes(&self) -> Result<Vec<String>> {
        let out = self.run(&["remote"])?;
        Ok(out.lines().map(|l| l.trim_end().to_string()).collect())
    }

    /// Add a `p2p-<peerid>` remote if it is not already configured.
    pub fn add_remote(&self, peerid: &str) -> Result<()> {
        let name = format!("p2p-{}", peerid);
        if self.remotes()?.contains(&name) {
            return Ok(());
        }
        let url = format!("p2p://{}", peerid);
        self.run(&["remote", "add", &name, &url]).map(|_| ())
    }

    /// Mapping of refs to commits. `show-ref` exits nonzero when there are
    /// no refs at all, which is not an error for us.
    pub fn refs(&self) -> HashMap<String, String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.directory)
            .args(["show-ref"])
            .output();

        match output {
            Ok(out) => parse_refs(&String::from_utf8_lossy(&out.stdout)),
            Err(_) => HashMap::new(),
        }
    }

    fn local_refs(&self) -> HashMap<String, String> {
        self.refs()
            .into_iter()
            .filter(|(r, _)| r.starts_with("refs/heads/"))
            .collect()
    }

    /// A deterministic string over the local heads, comparable to a
    /// previous value to decide whether any refs have changed.
    pub fn refs_signature(&self) -> String {
        signature_from(&self.local_refs())
    }

    /// Name of the currently checked out branch, if HEAD points at one.
    pub fn branch(&self) -> Option<String> {
        let line = self.run(&["symbolic-ref", "HEAD"]).ok()?;
        branch_from(line.trim_end())
    }
}

fn root_from_history(history: &str) -> (Option<String>, bool) {
    let mut candidates: Vec<&str> = history
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let commit = fields.next()?;
            fields.next().is_none().then_some(commit)
        })
        .collect();
    candidates.sort_unstable();

    let extra = candidates.len() > 1;
    (candidates.first().map(|c| c.to_string()), extra)
}

fn parse_refs(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let commit = fields.next()?;
            let reference = fields.next()?;
            Some((reference.to_string(), commit.to_string()))
        })
        .collect()
}

fn signature_from(refs: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = refs
        .iter()
        .map(|(reference, commit)| format!("{}:{}", reference, commit))
        .collect();
    parts.sort_unstable();
    parts.join(":")
}

fn branch_from(line: &str) -> Option<String> {
    line.strip_prefix("refs/heads/")
        .filter(|rest| !rest.is_empty() && !rest.contains(char::is_whitespace))
        .map(|rest| rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_parentless_commit() {
        let history = "\
ccc bbb\n\
bbb aaa\n\
aaa\n";
        let (root, extra) = root_from_history(history);
        assert_eq!(root.as_deref(), Some("aaa"));
        assert!(!extra);
    }

    #[test]
    fn multiple_roots_pick_lexically_first() {
        let history = "ccc aaa bbb\nbbb\naaa\n";
        let (root, extra) = root_from_history(history);
        assert_eq!(root.as_deref(), Some("aaa"));
        assert!(extra);
    }

    #[test]
    fn empty_history_has_no_root() {
        assert_eq!(root_from_history(""), (None, false));
    }

    #[test]
    fn signature_is_sorted_and_deterministic() {
        let mut refs = HashMap::new();
        refs.insert("refs/heads/main".to_string(), "1111".to_string());
        refs.insert("refs/heads/dev".to_string(), "2222".to_string());

        let sig = signature_from(&refs);
        assert_eq!(sig, "refs/heads/dev:2222:refs/heads/main:1111");
        assert_eq!(sig, signature_from(&refs.clone()));
    }

    #[test]
    fn empty_refs_signature_is_empty() {
        // A repository with no local heads signs as the empty string, the
        // same as the initial "never checked" state, so no ref_change is
        // emitted for it.
        assert_eq!(signature_from(&HashMap::new()), "");
    }

    #[test]
    fn show_ref_output_parses() {
        let refs = parse_refs(
            "1111111111111111111111111111111111111111 refs/heads/main\n\
             2222222222222222222222222222222222222222 refs/remotes/p2p-bob/main\n",
        );
        assert_eq!(refs["refs/heads/main"], "1".repeat(40));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn branch_extraction() {
        assert_eq!(branch_from("refs/heads/main").as_deref(), Some("main"));
        assert_eq!(
            branch_from("refs/heads/topic/x").as_deref(),
            Some("topic/x")
        );
        assert_eq!(branch_from("refs/tags/v1"), None);
        assert_eq!(branch_from("refs/heads/"), None);
    }
}
