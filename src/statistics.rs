use std::fmt;

/// Point-in-time snapshot of a collector.
pub struct GcStatistics {
    pub live_records: usize,
    pub capacity: usize,
    pub sweep_limit: usize,
    pub managed_bytes: usize,
    pub total_collections: usize,
    pub total_bytes_freed: usize,
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const UNITS: [&str; 3] = ["K", "M", "G"];
        let mut scaled = self.size as f64;
        let mut unit = None;
        for next in UNITS {
            if scaled < 1024.0 {
                break;
            }
            scaled /= 1024.0;
            unit = Some(next);
        }
        match unit {
            None => write!(f, "{}B", self.size),
            Some(unit) => write!(f, "{:.1}{}", scaled, unit),
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl fmt::Display for GcStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Collector statistics:")?;
        writeln!(
            f,
            "  Live records: {} of {} buckets (sweep limit {})",
            self.live_records, self.capacity, self.sweep_limit
        )?;
        writeln!(
            f,
            "  Managed bytes: {}",
            formatted_size(self.managed_bytes)
        )?;
        writeln!(f, "  Collections run: {}", self.total_collections)?;
        writeln!(
            f,
            "  Reclaimed to date: {}",
            formatted_size(self.total_bytes_freed)
        )?;
        Ok(())
    }
}
