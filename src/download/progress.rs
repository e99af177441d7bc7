use std::time::Duration;

/// Cumulative progress of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub bytes_received: u64,
    /// `None` when the server did not announce a length.
    pub bytes_expected: Option<u64>,
}

impl Progress {
    pub fn new(bytes_received: u64, bytes_expected: Option<u64>) -> Self {
        Self {
            bytes_received,
            bytes_expected,
        }
    }

    /// Completed fraction in `0.0..=1.0`, if the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_received as f64 / total as f64).min(1.0)),
        }
    }

    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0) as u8)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_unknown_total() {
        assert_eq!(Progress::new(10, None).fraction(), None);
        assert_eq!(Progress::new(10, Some(0)).fraction(), None);
    }

    #[test]
    fn test_percent() {
        assert_eq!(Progress::new(50, Some(200)).percent(), Some(25));
        // Servers occasionally send more than announced.
        assert_eq!(Progress::new(300, Some(200)).percent(), Some(100));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_speed(2048), "2.0 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
