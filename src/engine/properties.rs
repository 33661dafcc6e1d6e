//! Database Properties
//!
//! `stratakv.*` introspection strings served by `Engine::property`.

use std::fmt::Write as _;

use crate::config::NUM_LEVELS;

use super::DbInner;

const PREFIX: &str = "stratakv.";

const MB: f64 = 1_048_576.0;

impl DbInner {
    pub(super) fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix(PREFIX)?;
        let state = self.state.lock();

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let mut out = String::new();
                let _ = writeln!(out, "                               Compactions");
                let _ = writeln!(out, "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)");
                let _ = writeln!(out, "--------------------------------------------------");
                for (level, stats) in state.stats.iter().enumerate() {
                    let files = state.versions.num_level_files(level);
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}",
                        level,
                        files,
                        state.versions.num_level_bytes(level) as f64 / MB,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / MB,
                        stats.bytes_written as f64 / MB
                    );
                }
                Some(out)
            }
            "sstables" => Some(state.versions.current().debug_string()),
            "total-bytes" => {
                let total: u64 = (0..NUM_LEVELS).map(|level| state.versions.num_level_bytes(level)).sum();
                Some(total.to_string())
            }
            "write-penalty" => Some(state.versions.current().write_penalty().to_string()),
            "throttle-rate" => Some(self.context.throttle().rate().to_string()),
            "compactions" => Some(state.versions.compaction_summary()),
            _ => None,
        }
    }
}
