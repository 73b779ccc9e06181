/// Host process table snapshot used by the liveness probe.
///
/// On Linux the table is read straight from `/proc`. Elsewhere it falls back
/// to parsing `ps -axo pid=,ppid=,command=`.
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProcessTableError {
    #[error("failed to read {path}: {source}")]
    Proc {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to run ps: {0}")]
    Ps(std::io::Error),
    #[error("ps exited with {0}")]
    PsStatus(std::process::ExitStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    /// Full command line, arguments joined by single spaces.
    pub cmdline: String,
}

/// Where to look for a matching process.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// The given root pids and everything that descends from them.
    DescendantsOf(&'a [u32]),
    /// Everything that descends from the given root pids, but not the roots.
    Beneath(&'a [u32]),
    /// Every process on the host.
    Host,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
}

impl ProcessTable {
    #[cfg(test)]
    pub fn from_entries(entries: Vec<ProcessEntry>) -> Self {
        Self { entries }
    }

    /// Capture the current host process table.
    pub fn snapshot() -> Result<Self, ProcessTableError> {
        let proc_root = Path::new("/proc");
        if proc_root.join("self/stat").exists() {
            return Self::from_proc(proc_root);
        }
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()
            .map_err(ProcessTableError::Ps)?;
        if !output.status.success() {
            return Err(ProcessTableError::PsStatus(output.status));
        }
        Ok(Self::parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Read every numeric entry under a procfs root.
    ///
    /// Processes that exit between the directory listing and the reads are
    /// skipped; only a failure to list the root itself is an error.
    pub fn from_proc(root: &Path) -> Result<Self, ProcessTableError> {
        let dir = std::fs::read_dir(root).map_err(|e| ProcessTableError::Proc {
            path: root.display().to_string(),
            source: e,
        })?;

        let mut entries = Vec::new();
        for dent in dir.flatten() {
            let Some(pid) = dent.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(dent.path().join("stat")) else {
                continue;
            };
            let Some(ppid) = parse_stat_ppid(&stat) else {
                continue;
            };
            // Kernel threads have an empty cmdline; keep them so the
            // parent chain stays intact.
            let cmdline = std::fs::read(dent.path().join("cmdline"))
                .map(|raw| join_cmdline(&raw))
                .unwrap_or_default();
            entries.push(ProcessEntry { pid, ppid, cmdline });
        }
        Ok(Self { entries })
    }

    /// Parse `ps -axo pid=,ppid=,command=` output.
    pub fn parse_ps(output: &str) -> Self {
        let entries = output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let cmdline = parts.collect::<Vec<_>>().join(" ");
                Some(ProcessEntry { pid, ppid, cmdline })
            })
            .collect();
        Self { entries }
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[ProcessEntry] {
        &self.entries
    }

    /// Pids of `roots` and all of their descendants.
    pub fn descendants(&self, roots: &[u32]) -> HashSet<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in &self.entries {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }

        let mut seen: HashSet<u32> = HashSet::new();
        let mut stack: Vec<u32> = roots.to_vec();
        while let Some(pid) = stack.pop() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }
        seen
    }

    /// Processes in `scope` whose command line matches `pattern`.
    pub fn matching<'t>(
        &'t self,
        pattern: &'t Regex,
        scope: Scope<'_>,
    ) -> impl Iterator<Item = &'t ProcessEntry> + 't {
        let allowed = match scope {
            Scope::DescendantsOf(roots) => Some(self.descendants(roots)),
            Scope::Beneath(roots) => {
                let mut set = self.descendants(roots);
                for root in roots {
                    set.remove(root);
                }
                Some(set)
            }
            Scope::Host => None,
        };
        let own_pid = std::process::id();
        self.entries.iter().filter(move |entry| {
            entry.pid != own_pid
                && !entry.cmdline.is_empty()
                && allowed.as_ref().is_none_or(|set| set.contains(&entry.pid))
                && pattern.is_match(&entry.cmdline)
        })
    }

    /// First process in `scope` whose command line matches `pattern`.
    #[cfg(test)]
    pub fn find_matching<'t>(&'t self, pattern: &'t Regex, scope: Scope<'_>) -> Option<&'t ProcessEntry> {
        self.matching(pattern, scope).next()
    }
}

impl ProcessEntry {
    /// File name of the executable, as the command line spells it.
    ///
    /// A trailing `:` is dropped, since some servers retitle themselves as
    /// `name: server`.
    pub fn program_name(&self) -> &str {
        let first = self.cmdline.split_whitespace().next().unwrap_or_default();
        let base = first.rsplit('/').next().unwrap_or(first);
        base.trim_end_matches(':')
    }
}

/// Extract the parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name in field 2 may itself contain spaces and parentheses, so
/// parsing starts after the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, ppid: u32, cmdline: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid,
            cmdline: cmdline.to_string(),
        }
    }

    fn sample_table() -> ProcessTable {
        ProcessTable::from_entries(vec![
            entry(1, 0, "/sbin/init"),
            // tmux server: its argv still carries the new-session command
            entry(100, 1, "tmux new-session -d -s gw -- sh -c exec gateway run"),
            entry(200, 100, "-bash"),
            entry(201, 200, "node /opt/gateway run"),
            entry(300, 100, "-bash"),
            // unrelated process elsewhere on the host
            entry(400, 1, "node /home/other/gateway run"),
        ])
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("123 (bash) S 45 123 123 0 -1"), Some(45));
    }

    #[test]
    fn test_parse_stat_ppid_with_parens_in_comm() {
        assert_eq!(
            parse_stat_ppid("77 (weird) name (x)) R 12 77 77 0 -1"),
            Some(12)
        );
    }

    #[test]
    fn test_parse_stat_ppid_garbage() {
        assert_eq!(parse_stat_ppid("no parens here"), None);
        assert_eq!(parse_stat_ppid("1 (x)"), None);
    }

    #[test]
    fn test_join_cmdline() {
        assert_eq!(join_cmdline(b"node\0/opt/gateway\0run\0"), "node /opt/gateway run");
        assert_eq!(join_cmdline(b""), "");
    }

    #[test]
    fn test_parse_ps() {
        let table = ProcessTable::parse_ps(
            "    1     0 /sbin/launchd\n  501     1 /usr/bin/node /opt/gw   run\nbogus line\n",
        );
        assert_eq!(
            table.entries(),
            &[
                entry(1, 0, "/sbin/launchd"),
                entry(501, 1, "/usr/bin/node /opt/gw run"),
            ]
        );
    }

    #[test]
    fn test_descendants_includes_roots() {
        let table = sample_table();
        let set = table.descendants(&[200]);
        assert_eq!(set, HashSet::from([200, 201]));
    }

    #[test]
    fn test_descendants_of_multiple_roots() {
        let table = sample_table();
        let set = table.descendants(&[200, 300]);
        assert_eq!(set, HashSet::from([200, 201, 300]));
    }

    #[test]
    fn test_find_matching_descendant_scope() {
        let table = sample_table();
        let re = Regex::new(&regex::escape("gateway run")).unwrap();
        let found = table
            .find_matching(&re, Scope::DescendantsOf(&[200, 300]))
            .unwrap();
        assert_eq!(found.pid, 201);
    }

    #[test]
    fn test_find_matching_ignores_unrelated_process() {
        let table = sample_table();
        let re = Regex::new(&regex::escape("gateway run")).unwrap();
        // pane 300 has no worker; 400 and the tmux server must not count
        assert!(table
            .find_matching(&re, Scope::DescendantsOf(&[300]))
            .is_none());
    }

    #[test]
    fn test_find_matching_host_scope_is_weaker() {
        let table = sample_table();
        let re = Regex::new(&regex::escape("gateway run")).unwrap();
        // host-wide matching is fooled by the tmux server's own argv
        let found = table.find_matching(&re, Scope::Host).unwrap();
        assert_eq!(found.pid, 100);
    }

    #[test]
    fn test_beneath_excludes_roots() {
        let table = ProcessTable::from_entries(vec![
            entry(4242, 1, "SCREEN -dmS gw sh -c exec /opt/gw/bin/gateway run"),
            entry(4243, 4242, "/bin/bash"),
        ]);
        let re = Regex::new(&regex::escape("gateway run")).unwrap();
        assert!(table
            .find_matching(&re, Scope::Beneath(&[4242]))
            .is_none());
        // the inclusive scope is fooled by the server's own argv
        assert_eq!(
            table
                .find_matching(&re, Scope::DescendantsOf(&[4242]))
                .unwrap()
                .pid,
            4242
        );
    }

    #[test]
    fn test_beneath_finds_worker_child() {
        let table = ProcessTable::from_entries(vec![
            entry(4242, 1, "SCREEN -dmS gw sh -c exec /opt/gw/bin/gateway run"),
            entry(4243, 4242, "/opt/gw/bin/gateway run"),
        ]);
        let re = Regex::new(&regex::escape("gateway run")).unwrap();
        let found = table.find_matching(&re, Scope::Beneath(&[4242])).unwrap();
        assert_eq!(found.pid, 4243);
    }

    #[test]
    fn test_program_name() {
        assert_eq!(entry(1, 0, "/usr/bin/tmux new -d").program_name(), "tmux");
        assert_eq!(entry(1, 0, "tmux: server (/tmp/x)").program_name(), "tmux");
        assert_eq!(entry(1, 0, "SCREEN -dmS gw").program_name(), "SCREEN");
        assert_eq!(entry(1, 0, "").program_name(), "");
    }

    #[test]
    fn test_find_matching_skips_self() {
        let own = std::process::id();
        let table = ProcessTable::from_entries(vec![entry(own, 1, "warden gateway run")]);
        let re = Regex::new("gateway run").unwrap();
        assert!(table.find_matching(&re, Scope::Host).is_none());
    }

    #[test]
    fn test_from_proc_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        std::fs::create_dir_all(p.join("10")).unwrap();
        std::fs::write(p.join("10/stat"), "10 (sh) S 1 10 10 0").unwrap();
        std::fs::write(p.join("10/cmdline"), b"sh\0-c\0sleep 5\0").unwrap();
        std::fs::create_dir_all(p.join("11")).unwrap();
        std::fs::write(p.join("11/stat"), "11 (kthread) S 2 0 0 0").unwrap();
        // non-numeric entries are ignored
        std::fs::create_dir_all(p.join("self")).unwrap();
        // pid dir that vanished before its stat was read
        std::fs::create_dir_all(p.join("12")).unwrap();

        let mut table = ProcessTable::from_proc(p).unwrap();
        table.entries.sort_by_key(|e| e.pid);
        assert_eq!(
            table.entries(),
            &[entry(10, 1, "sh -c sleep 5"), entry(11, 2, "")]
        );
    }

    #[test]
    fn test_snapshot_sees_current_process() {
        let table = ProcessTable::snapshot().unwrap();
        let own = std::process::id();
        assert!(table.entries().iter().any(|e| e.pid == own));
    }
}
