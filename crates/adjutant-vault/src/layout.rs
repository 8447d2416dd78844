//! Canonical vault layout: the fixed stage set and the three singletons.

use std::fs;
use std::path::{Path, PathBuf};

use adjutant_types::Stage;

/// Operator-facing summary file; only fenced regions are machine-rewritten.
pub const DASHBOARD_FILE: &str = "Dashboard.md";
/// Policy document consulted by the gate (thresholds live in config; the
/// handbook is the human-readable counterpart).
pub const HANDBOOK_FILE: &str = "Company_Handbook.md";
pub const GOALS_FILE: &str = "Business_Goals.md";

/// Fence markers for the dashboard region owned by the signal merge.
pub const SIGNALS_REGION_BEGIN: &str = "<!-- adjutant:signals -->";
pub const SIGNALS_REGION_END: &str = "<!-- /adjutant:signals -->";
/// Fence markers for the stage-count region owned by the dashboard refresh.
pub const STAGES_REGION_BEGIN: &str = "<!-- adjutant:stages -->";
pub const STAGES_REGION_END: &str = "<!-- /adjutant:stages -->";

const DASHBOARD_TEMPLATE: &str = "\
# Dashboard

<!-- adjutant:stages -->
(no stage summary yet)
<!-- /adjutant:stages -->

<!-- adjutant:signals -->
(no peer signals yet)
<!-- /adjutant:signals -->
";

const HANDBOOK_TEMPLATE: &str = "\
# Company Handbook

Operating rules for the orchestrator. Edit freely; the machine-enforced
counterparts (amount threshold, rate limits, expiry) live in `.adjutant.toml`.

- Never delete. Completed or refused work moves to `Done/` or `Rejected/`.
- No external side-effect without a stay in `Approved/`.
- Spending above the configured threshold needs an explicit approval note.
";

const GOALS_TEMPLATE: &str = "\
# Business Goals

(Describe the goals the reasoning layer should work toward.)
";

/// Stage directories missing under `root`.
pub fn missing_stages(root: &Path) -> Vec<Stage> {
    Stage::all()
        .into_iter()
        .filter(|stage| !root.join(stage.rel_path()).is_dir())
        .collect()
}

/// Create every stage directory (idempotent). Each gets a `.gitkeep` so
/// empty queues survive a git-synced remote; listings skip dotfiles.
pub fn create_stages(root: &Path) -> std::io::Result<()> {
    for stage in Stage::all() {
        let dir = root.join(stage.rel_path());
        fs::create_dir_all(&dir)?;
        let keep = dir.join(".gitkeep");
        if !keep.exists() {
            fs::write(keep, "")?;
        }
    }
    Ok(())
}

/// Create the singleton files that don't exist yet.
pub fn create_singletons(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for (name, content) in [
        (DASHBOARD_FILE, DASHBOARD_TEMPLATE),
        (HANDBOOK_FILE, HANDBOOK_TEMPLATE),
        (GOALS_FILE, GOALS_TEMPLATE),
    ] {
        let path = root.join(name);
        if !path.exists() {
            fs::write(&path, content)?;
            created.push(path);
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_stages_builds_the_full_set() {
        let td = tempdir().expect("tempdir");
        create_stages(td.path()).expect("create");
        assert!(missing_stages(td.path()).is_empty());
        assert!(td.path().join("In_Progress/local").is_dir());
        assert!(td.path().join("In_Progress/cloud").is_dir());
    }

    #[test]
    fn missing_stages_reports_gaps() {
        let td = tempdir().expect("tempdir");
        create_stages(td.path()).expect("create");
        fs::remove_dir_all(td.path().join("Signals")).expect("remove");
        let missing = missing_stages(td.path());
        assert_eq!(missing, vec![Stage::Signals]);
    }

    #[test]
    fn singletons_are_created_once() {
        let td = tempdir().expect("tempdir");
        let first = create_singletons(td.path()).expect("create");
        assert_eq!(first.len(), 3);
        fs::write(td.path().join(DASHBOARD_FILE), "edited").expect("write");
        let second = create_singletons(td.path()).expect("create");
        assert!(second.is_empty());
        let content = fs::read_to_string(td.path().join(DASHBOARD_FILE)).expect("read");
        assert_eq!(content, "edited");
    }
}
