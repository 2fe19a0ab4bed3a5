//! Plain-text export summary written next to a session's data

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;

/// Role assignment line for the summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleLine {
    pub player_id: u32,
    pub role: String,
    pub is_human: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryInfo {
    pub app: String,
    pub session_code: String,
    /// `_{app}_nhumans{h}_nbots{b}`, shared by every file of the session
    pub suffix: String,
    pub participants: usize,
    pub humans: usize,
    pub bots: usize,
    pub roles: Vec<RoleLine>,
}

/// Write `data_export_summary_{code}{suffix}.txt` into `out_dir`, listing the
/// CSV files present there.
pub fn write_summary(out_dir: &Path, info: &SummaryInfo) -> Result<PathBuf> {
    let mut csv_files: Vec<(String, u64)> = Vec::new();
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".csv") {
            csv_files.push((name, entry.metadata()?.len()));
        }
    }
    csv_files.sort();

    let rule = "-".repeat(20);
    let mut text = String::new();
    let _ = writeln!(
        text,
        "Data Export Summary - {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(text, "{}\n", "=".repeat(70));

    let _ = writeln!(text, "FILES EXPORTED:\n{}", rule);
    for (name, size) in &csv_files {
        let _ = writeln!(text, "  {} ({} bytes)", name, group_thousands(*size));
    }

    let _ = writeln!(text, "\nEXPERIMENT DETAILS:\n{}", rule);
    let _ = writeln!(text, "App: {}", info.app);
    let _ = writeln!(text, "Session ID: {}", info.session_code);
    let _ = writeln!(text, "Total Participants: {}", info.participants);
    let _ = writeln!(text, "Human Participants: {}", info.humans);
    let _ = writeln!(text, "Bot Participants: {}", info.bots);

    if !info.roles.is_empty() {
        let _ = writeln!(text, "\nROLE ASSIGNMENTS:\n{}", rule);
        for line in &info.roles {
            let kind = if line.is_human { "HUMAN" } else { "BOT" };
            let model = match (&line.model, line.is_human) {
                (Some(m), false) => format!(" ({})", m),
                _ => String::new(),
            };
            let _ = writeln!(text, "  Player {}: {} ({}){}", line.player_id, line.role, kind, model);
        }
    }

    let path = out_dir.join(format!(
        "data_export_summary_{}{}.txt",
        info.session_code, info.suffix
    ));
    std::fs::write(&path, text)?;
    Ok(path)
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "x".repeat(1234)).unwrap();
        std::fs::write(dir.path().join("a.csv"), "y").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let info = SummaryInfo {
            app: "rps_repeat".into(),
            session_code: "abcd1234".into(),
            suffix: "_rps_repeat_nhumans1_nbots1".into(),
            participants: 2,
            humans: 1,
            bots: 1,
            roles: vec![
                RoleLine {
                    player_id: 1,
                    role: "P2".into(),
                    is_human: true,
                    model: None,
                },
                RoleLine {
                    player_id: 2,
                    role: "P4".into(),
                    is_human: false,
                    model: Some("gpt-4o-mini".into()),
                },
            ],
        };
        let path = write_summary(dir.path(), &info).unwrap();
        assert!(path.ends_with("data_export_summary_abcd1234_rps_repeat_nhumans1_nbots1.txt"));

        let text = std::fs::read_to_string(path).unwrap();
        let a = text.find("  a.csv (1 bytes)").unwrap();
        let b = text.find("  b.csv (1,234 bytes)").unwrap();
        assert!(a < b);
        assert!(!text.contains("notes.txt"));
        assert!(text.contains("Human Participants: 1"));
        assert!(text.contains("  Player 1: P2 (HUMAN)\n"));
        assert!(text.contains("  Player 2: P4 (BOT) (gpt-4o-mini)"));
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
