//! CSV step log
//!
//! One row per optimizer step (`elapsed_ms` is that step's wall time),
//! flushed immediately so a crashed run keeps every completed step.
//!
//! ```text
//! step,elapsed_ms,loss,lr,grad_norm,tokens_per_sec
//! 0,1834.21,10.9871,6.0000e-5,8.2341,35721.40
//! ```

use crate::error::Result;
use crate::train::StepReport;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const CSV_HEADER: &str = "step,elapsed_ms,loss,lr,grad_norm,tokens_per_sec";

pub struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    /// Create (or truncate) the file and write the header
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn log(&mut self, report: &StepReport) -> Result<()> {
        writeln!(
            self.writer,
            "{},{:.2},{:.6},{:.4e},{:.4},{:.2}",
            report.step,
            report.step_ms,
            report.loss,
            report.lr,
            report.grad_norm,
            report.tokens_per_sec
        )?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_follow_header() {
        let path = std::env::temp_dir().join(format!("metrics_{}.csv", std::process::id()));
        {
            let mut log = MetricsLog::create(&path).unwrap();
            let report = StepReport {
                step: 3,
                loss: 2.5,
                lr: 6e-4,
                grad_norm: 0.75,
                step_ms: 12.0,
                tokens_per_sec: 1000.0,
            };
            log.log(&report).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "3,12.00,2.500000,6.0000e-4,0.7500,1000.00");
    }
}
