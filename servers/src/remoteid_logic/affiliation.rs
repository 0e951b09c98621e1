//! Identifier-to-affiliation mapping, loaded from an operator-maintained INI
//! file and reloaded whenever the file's mtime changes. Affiliation picks the
//! color embedded in tactical events.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Authorized,
    Unauthorized,
    Unknown,
}

impl Affiliation {
    /// ARGB color string understood by tactical-map consumers.
    pub fn argb(self) -> &'static str {
        match self {
            Affiliation::Authorized => "-16776961",   // blue
            Affiliation::Unauthorized => "-65536",    // red
            Affiliation::Unknown => "-256",           // yellow
        }
    }

    fn from_section(name: &str) -> Option<Self> {
        match name {
            "authorized" => Some(Affiliation::Authorized),
            "unauthorized" => Some(Affiliation::Unauthorized),
            "unknown" => Some(Affiliation::Unknown),
            _ => None,
        }
    }
}

pub struct AffiliationTable {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    map: HashMap<String, Affiliation>,
}

impl AffiliationTable {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            mtime: None,
            map: HashMap::new(),
        }
    }

    /// Affiliation for an entity identifier; identifiers not listed in the
    /// file are `Unknown`.
    pub fn lookup(&mut self, id: &str) -> Affiliation {
        self.reload_if_changed();
        self.map.get(id).copied().unwrap_or(Affiliation::Unknown)
    }

    fn reload_if_changed(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        let mtime = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return, // keep the last good table
        };
        if self.mtime == Some(mtime) {
            return;
        }
        match fs::read_to_string(path) {
            Ok(contents) => {
                self.map = parse_ini(&contents);
                self.mtime = Some(mtime);
                log::info!(
                    "affiliation file '{}' loaded ({} entries)",
                    path.display(),
                    self.map.len()
                );
            }
            Err(e) => log::warn!("failed to read affiliation file: {e}"),
        }
    }
}

/// The file format is a three-section INI where each section carries one
/// `uids = a, b, c` list:
///
/// ```ini
/// [authorized]
/// uids = drone-SN1, drone-SN2
/// ```
fn parse_ini(contents: &str) -> HashMap<String, Affiliation> {
    let mut map = HashMap::new();
    let mut section: Option<Affiliation> = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = Affiliation::from_section(name.trim());
            continue;
        }
        let Some(aff) = section else { continue };
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "uids" {
                for uid in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    map.insert(uid.to_string(), aff);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
[authorized]
uids = drone-SN1, drone-SN2

[unauthorized]
uids = drone-BAD

[unknown]
uids =
";

    #[test]
    fn sections_map_to_affiliations() {
        let map = parse_ini(SAMPLE);
        assert_eq!(map.get("drone-SN1"), Some(&Affiliation::Authorized));
        assert_eq!(map.get("drone-BAD"), Some(&Affiliation::Unauthorized));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn unlisted_id_is_unknown() {
        let mut table = AffiliationTable::new(None);
        assert_eq!(table.lookup("drone-NEW"), Affiliation::Unknown);
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{SAMPLE}").unwrap();
        let mut table = AffiliationTable::new(Some(file.path().to_path_buf()));
        assert_eq!(table.lookup("drone-SN1"), Affiliation::Authorized);

        // Rewrite with a different membership and a newer mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut file2 = std::fs::File::create(file.path()).unwrap();
        write!(file2, "[unauthorized]\nuids = drone-SN1\n").unwrap();
        drop(file2);
        filetime_touch(file.path());
        assert_eq!(table.lookup("drone-SN1"), Affiliation::Unauthorized);
    }

    // mtime granularity on some filesystems is one second; force a change.
    fn filetime_touch(path: &std::path::Path) {
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(later).unwrap();
    }

    #[test]
    fn colors_match_tactical_palette() {
        assert_eq!(Affiliation::Authorized.argb(), "-16776961");
        assert_eq!(Affiliation::Unauthorized.argb(), "-65536");
        assert_eq!(Affiliation::Unknown.argb(), "-256");
    }
}
