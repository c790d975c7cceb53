pub mod ids;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnits {
    /// Powers of 1024: KiB, MiB, ...
    #[default]
    Iec,
    /// Powers of 1000: kB, MB, ...
    Si,
    /// Raw byte count.
    Bytes,
}

impl SizeUnits {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iec" => Some(SizeUnits::Iec),
            "si" => Some(SizeUnits::Si),
            "bytes" | "b" => Some(SizeUnits::Bytes),
            _ => None,
        }
    }

    fn scale(self) -> Option<(f64, &'static [&'static str])> {
        match self {
            SizeUnits::Iec => Some((1024.0, &["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"])),
            SizeUnits::Si => Some((1000.0, &["kB", "MB", "GB", "TB", "PB", "EB"])),
            SizeUnits::Bytes => None,
        }
    }
}

pub fn format_size(bytes: u64, units: SizeUnits) -> String {
    let Some((base, suffixes)) = units.scale() else {
        return format!("{bytes} B");
    };
    if (bytes as f64) < base {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut suffix = suffixes[0];
    for candidate in suffixes {
        value /= base;
        suffix = candidate;
        if value < base {
            break;
        }
    }
    format!("{value:.1} {suffix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    List,
    Download,
    Upload,
    Copy,
    Rename,
    CreateDir,
    Delete,
}

impl TaskAction {
    pub fn verb(self) -> &'static str {
        match self {
            TaskAction::List => "Listing",
            TaskAction::Download => "Downloading",
            TaskAction::Upload => "Uploading",
            TaskAction::Copy => "Copying",
            TaskAction::Rename => "Renaming",
            TaskAction::CreateDir => "Creating folder",
            TaskAction::Delete => "Deleting",
        }
    }
}

/// Human-readable name shown in the task list.
pub fn task_name(action: TaskAction, subject: &str) -> String {
    if subject.is_empty() {
        action.verb().to_string()
    } else {
        format!("{} {subject}", action.verb())
    }
}

pub fn notification_line(title: &str, message: &str) -> String {
    if message.is_empty() {
        title.to_string()
    } else {
        format!("{title}: {message}")
    }
}

/// `42%`, or `--%` while the total is unknown.
pub fn progress_label(fraction: Option<f64>) -> String {
    match fraction {
        Some(value) if value.is_finite() => {
            format!("{:.0}%", (value.clamp(0.0, 1.0) * 100.0).floor())
        }
        _ => "--%".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_iec_sizes() {
        assert_eq!(format_size(0, SizeUnits::Iec), "0 B");
        assert_eq!(format_size(1023, SizeUnits::Iec), "1023 B");
        assert_eq!(format_size(1024, SizeUnits::Iec), "1.0 KiB");
        assert_eq!(format_size(1536, SizeUnits::Iec), "1.5 KiB");
        assert_eq!(format_size(10 * 1024 * 1024, SizeUnits::Iec), "10.0 MiB");
        assert_eq!(format_size(u64::MAX, SizeUnits::Iec), "16.0 EiB");
    }

    #[test]
    fn formats_si_and_raw_sizes() {
        assert_eq!(format_size(999, SizeUnits::Si), "999 B");
        assert_eq!(format_size(1_000_000, SizeUnits::Si), "1.0 MB");
        assert_eq!(format_size(2_500_000_000, SizeUnits::Si), "2.5 GB");
        assert_eq!(format_size(1_234_567, SizeUnits::Bytes), "1234567 B");
    }

    #[test]
    fn parses_unit_names() {
        assert_eq!(SizeUnits::parse(" SI "), Some(SizeUnits::Si));
        assert_eq!(SizeUnits::parse("bytes"), Some(SizeUnits::Bytes));
        assert_eq!(SizeUnits::parse("metric"), None);
        let units: SizeUnits = serde_json::from_str("\"iec\"").unwrap();
        assert_eq!(units, SizeUnits::Iec);
    }

    #[test]
    fn names_tasks() {
        assert_eq!(
            task_name(TaskAction::Copy, "/home/ann/a.txt"),
            "Copying /home/ann/a.txt"
        );
        assert_eq!(task_name(TaskAction::CreateDir, ""), "Creating folder");
    }

    #[test]
    fn renders_notifications_and_progress() {
        assert_eq!(notification_line("Not Found", "/x"), "Not Found: /x");
        assert_eq!(notification_line("Done", ""), "Done");
        assert_eq!(progress_label(Some(0.426)), "42%");
        assert_eq!(progress_label(Some(1.0)), "100%");
        assert_eq!(progress_label(None), "--%");
    }
}
