use std::path::Path;

use crate::config::Config;
use crate::content::parse_cache_file_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckStatus {
    fn icon(self) -> &'static str {
        match self {
            CheckStatus::Ok => "✓",
            CheckStatus::Warning => "⚠",
            CheckStatus::Error => "✗",
        }
    }

    fn color(self) -> &'static str {
        match self {
            CheckStatus::Ok => "\x1b[32m",
            CheckStatus::Warning => "\x1b[33m",
            CheckStatus::Error => "\x1b[31m",
        }
    }
}

/// Outcome of one check, with what to do about it when it is not ok
#[derive(Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub hint: Option<String>,
}

impl CheckResult {
    fn new(name: &'static str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: message.into(),
            hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub fn run_checks(config: &Config) -> Vec<CheckResult> {
    let dir = config.cache.dir();
    vec![
        check_tool(
            "Downloader",
            &config.youtube.downloader,
            CheckStatus::Error,
            "install youtube-dl or yt-dlp, or point [youtube] downloader at it",
        ),
        check_tool(
            "ffmpeg",
            &config.youtube.ffmpeg,
            CheckStatus::Error,
            "install ffmpeg, or set [youtube] ffmpeg",
        ),
        check_tool(
            "Player",
            &config.player.command,
            CheckStatus::Warning,
            "set [player] command to mpv, ffplay or vlc for local playback",
        ),
        check_cache_dir(&dir),
        check_cached_items(&dir),
    ]
}

fn check_tool(name: &'static str, command: &str, missing: CheckStatus, hint: &str) -> CheckResult {
    match which::which(command) {
        Ok(path) => CheckResult::new(
            name,
            CheckStatus::Ok,
            format!("{} found at {}", command, path.display()),
        ),
        Err(_) => CheckResult::new(name, missing, format!("'{}' not found in PATH", command))
            .hint(hint),
    }
}

fn check_cache_dir(dir: &Path) -> CheckResult {
    let unusable = |message: String| {
        CheckResult::new("Cache", CheckStatus::Error, message)
            .hint("set [cache] dir to a writable directory")
    };

    if let Err(e) = std::fs::create_dir_all(dir) {
        return unusable(format!("Cannot create {}: {}", dir.display(), e));
    }
    let check_file = dir.join(".jukebot_write_check");
    match std::fs::write(&check_file, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&check_file);
            CheckResult::new("Cache", CheckStatus::Ok, dir.display().to_string())
        }
        Err(e) => unusable(format!("{} is not writable: {}", dir.display(), e)),
    }
}

fn check_cached_items(dir: &Path) -> CheckResult {
    match count_cached(dir) {
        Ok(0) => CheckResult::new("Autoplay", CheckStatus::Warning, "Cache is empty")
            .hint("autoplay only picks from downloaded items; request a few first"),
        Ok(n) => CheckResult::new("Autoplay", CheckStatus::Ok, format!("{} cached item(s)", n)),
        Err(e) => CheckResult::new(
            "Autoplay",
            CheckStatus::Error,
            format!("Cannot list cache dir: {}", e),
        ),
    }
}

/// Files following the `<provider>:<id>.<ext>` naming; staging leftovers don't count
pub fn count_cached(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        if name.to_str().is_some_and(|n| parse_cache_file_name(n).is_some()) {
            count += 1;
        }
    }
    Ok(count)
}

/// One line per check, hints indented below, then what the failures mean
pub fn render(results: &[CheckResult]) -> String {
    let reset = "\x1b[0m";
    let mut out = String::from("\njukebot doctor\n\n");

    for result in results {
        out.push_str(&format!(
            "  {}{} {:<10}{} {}\n",
            result.status.color(),
            result.status.icon(),
            result.name,
            reset,
            result.message
        ));
        if let Some(hint) = &result.hint {
            out.push_str(&format!("               → {}\n", hint));
        }
    }
    out.push('\n');

    let failed = |name: &str| {
        results
            .iter()
            .any(|r| r.name == name && r.status == CheckStatus::Error)
    };
    if failed("Cache") {
        out.push_str("  Nothing can be downloaded until the cache dir is usable.\n");
    } else if failed("Downloader") || failed("ffmpeg") {
        out.push_str("  YouTube requests will fail; niconico still works.\n");
    } else if results.iter().any(|r| r.status == CheckStatus::Warning) {
        out.push_str("  Ready, with the warnings above.\n");
    } else {
        out.push_str("  Ready to take requests.\n");
    }
    out
}

pub fn print_results(results: &[CheckResult]) {
    println!("{}", render(results));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_cached_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "youtube:dQw4w9WgXcQ.mp4",
            "niconico:sm9.m4a",
            "niconico:sm10.partial.m4a",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        assert_eq!(count_cached(dir.path()).unwrap(), 2);
    }

    #[test]
    fn test_missing_tool_severity_and_hint() {
        let missing = "definitely-not-a-real-tool";
        let result = check_tool("Player", missing, CheckStatus::Warning, "set it");
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.hint.as_deref(), Some("set it"));

        let result = check_tool("ffmpeg", missing, CheckStatus::Error, "install it");
        assert_eq!(result.status, CheckStatus::Error);
    }

    #[test]
    fn test_cache_dir_created_and_writable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested/media");
        let result = check_cache_dir(&cache);
        assert_eq!(result.status, CheckStatus::Ok);
        assert!(result.hint.is_none());
        assert!(cache.is_dir());
        assert!(!cache.join(".jukebot_write_check").exists());
    }

    #[test]
    fn test_render_explains_missing_downloader() {
        let results = vec![
            CheckResult::new("Downloader", CheckStatus::Error, "'youtube-dl' not found in PATH")
                .hint("install youtube-dl"),
            CheckResult::new("Cache", CheckStatus::Ok, "/tmp/media"),
        ];
        let text = render(&results);
        assert!(text.contains("→ install youtube-dl"));
        assert!(text.contains("YouTube requests will fail"));
    }

    #[test]
    fn test_render_all_ok() {
        let results = vec![CheckResult::new("Cache", CheckStatus::Ok, "/tmp/media")];
        assert!(render(&results).contains("Ready to take requests."));
    }
}
