//! Snapshot output.
//!
//! The engine gathers the global population to the root rank and hands it to
//! a [`SnapshotWriter`]. Write failures are reported to the caller and the
//! simulation keeps running; a full disk should not waste compute.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::exchange::ParticlePayload;

/// Sink for gathered simulation states. Only the root rank ever calls this.
pub trait SnapshotWriter: Send {
    /// Write one snapshot of the full population taken at simulated time `t`.
    fn write(&mut self, t: f64, particles: &ParticlePayload) -> io::Result<()>;
}

/// Writes plain-text snapshots, one file per snapshot, sequence number
/// appended to the configured base name.
pub struct AsciiSnapshotWriter {
    base: String,
    seq: u64,
}

impl AsciiSnapshotWriter {
    /// Writer producing `{base}000000`, `{base}000001`, ...
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            seq: 0,
        }
    }

    fn next_path(&mut self) -> PathBuf {
        let path = PathBuf::from(format!("{}{:06}", self.base, self.seq));
        self.seq += 1;
        path
    }
}

impl SnapshotWriter for AsciiSnapshotWriter {
    fn write(&mut self, t: f64, particles: &ParticlePayload) -> io::Result<()> {
        let path = self.next_path();
        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{} {}", particles.len(), t)?;
        for i in 0..particles.len() {
            let p = particles.pos[i];
            let v = particles.vel[i];
            writeln!(
                out,
                "{} {} {} {} {} {} {} {}",
                particles.ids[i], p.w, p.x, p.y, p.z, v.x, v.y, v.z
            )?;
        }
        out.flush()?;
        tracing::info!(path = %path.display(), count = particles.len(), t, "snapshot written");
        Ok(())
    }
}

/// Keeps snapshots in memory. Test sink.
#[derive(Default)]
pub struct MemorySnapshotWriter {
    /// Every snapshot taken, in order.
    pub frames: Vec<(f64, ParticlePayload)>,
}

impl MemorySnapshotWriter {
    /// An empty in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotWriter for MemorySnapshotWriter {
    fn write(&mut self, t: f64, particles: &ParticlePayload) -> io::Result<()> {
        self.frames.push((t, particles.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::Vec4;

    fn sample_payload() -> ParticlePayload {
        let mut p = ParticlePayload::new();
        p.pos.push(Vec4::new(1.0, 2.0, 3.0, 0.5));
        p.vel.push(Vec4::new(-0.1, 0.0, 0.1, 0.05));
        p.acc0.push(Vec4::ZERO);
        p.time.push([0.0, 0.0625]);
        p.ids.push(42);
        p
    }

    #[test]
    fn ascii_writer_emits_header_and_rows() {
        let base = std::env::temp_dir()
            .join("nbody_snap_test_")
            .to_string_lossy()
            .into_owned();
        let mut writer = AsciiSnapshotWriter::new(&base);
        writer.write(0.25, &sample_payload()).expect("writes");

        let path = format!("{base}000000");
        let contents = std::fs::read_to_string(&path).expect("file exists");
        let _ = std::fs::remove_file(&path);

        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("1 0.25"));
        let row = lines.next().expect("one particle row");
        let fields: Vec<&str> = row.split_whitespace().collect();
        assert_eq!(fields[0], "42");
        assert_eq!(fields[1], "0.5");
        assert_eq!(fields.len(), 8);
    }

    #[test]
    fn sequence_numbers_advance() {
        let base = std::env::temp_dir()
            .join("nbody_snap_seq_")
            .to_string_lossy()
            .into_owned();
        let mut writer = AsciiSnapshotWriter::new(&base);
        writer.write(0.0, &sample_payload()).expect("writes");
        writer.write(0.5, &sample_payload()).expect("writes");
        for seq in ["000000", "000001"] {
            let path = format!("{base}{seq}");
            assert!(std::path::Path::new(&path).exists(), "missing {path}");
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn memory_writer_records_frames() {
        let mut writer = MemorySnapshotWriter::new();
        writer.write(1.5, &sample_payload()).expect("writes");
        assert_eq!(writer.frames.len(), 1);
        assert_eq!(writer.frames[0].0, 1.5);
        assert_eq!(writer.frames[0].1.ids, vec![42]);
    }
}
