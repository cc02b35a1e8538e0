use crate::pipeline::collaborators::SubtitleParser;
use crate::pipeline::job::Segment;
use anyhow::Context;
use std::path::Path;

/// Minimal SRT reader: blank-line separated blocks, `HH:MM:SS,mmm` timecodes.
/// Malformed blocks are skipped with a warning rather than failing the file.
pub struct SrtParser;

impl SubtitleParser for SrtParser {
    fn parse(&self, path: &Path) -> anyhow::Result<Vec<Segment>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");

        let mut segments = Vec::new();
        for block in content.split("\n\n") {
            let lines: Vec<&str> = block.trim().lines().collect();
            // Sequence number, timecode line, at least one text line.
            if lines.len() < 3 {
                continue;
            }
            let Some((start, end)) = lines[1].split_once(" --> ") else {
                tracing::warn!("Skipping SRT block without timecode: {:?}", lines[0]);
                continue;
            };
            let (Ok(start), Ok(end)) = (parse_timecode(start), parse_timecode(end)) else {
                tracing::warn!("Skipping SRT block with bad timecode: {:?}", lines[1]);
                continue;
            };

            let text = lines[2..].join("\n");
            segments.push(Segment::new(segments.len(), start, end, text));
        }

        tracing::info!("Parsed {} segments from {}", segments.len(), path.display());
        Ok(segments)
    }
}

/// `HH:MM:SS,mmm` (or `.mmm`) to seconds.
fn parse_timecode(timecode: &str) -> anyhow::Result<f64> {
    let normalized = timecode.trim().replace(',', ".");
    let parts: Vec<&str> = normalized.split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        anyhow::bail!("bad timecode: {timecode}");
    };

    let hours: f64 = hours.parse().context("bad hours field")?;
    let minutes: f64 = minutes.parse().context("bad minutes field")?;
    let seconds: f64 = seconds.parse().context("bad seconds field")?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "1\n00:00:01,500 --> 00:00:04,200\nFirst line\n\n2\n00:00:05,000 --> 00:00:08,750\nSecond line\nwith a continuation\n";

    fn write_srt(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_sample_file() {
        let file = write_srt(SAMPLE);
        let segments = SrtParser.parse(file.path()).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].index, 0);
        assert_eq!(segments[0].start_time, 1.5);
        assert_eq!(segments[0].end_time, 4.2);
        assert_eq!(segments[1].text, "Second line\nwith a continuation");
    }

    #[test]
    fn test_malformed_block_is_skipped() {
        let file = write_srt("1\nnot a timecode\ntext\n\n2\n00:01:00,000 --> 00:01:02,000\nok\n");
        let segments = SrtParser.parse(file.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_time, 60.0);
        // Indices stay dense after a skip.
        assert_eq!(segments[0].index, 0);
    }

    #[test]
    fn test_timecode_parsing() {
        assert_eq!(parse_timecode("01:02:03,400").unwrap(), 3723.4);
        assert_eq!(parse_timecode("00:00:00,000").unwrap(), 0.0);
        assert!(parse_timecode("02:03,400").is_err());
        assert!(parse_timecode("a:b:c").is_err());
    }

    #[test]
    fn test_crlf_and_bom_tolerated() {
        let file = write_srt("\u{feff}1\r\n00:00:01,000 --> 00:00:02,000\r\nhello\r\n");
        let segments = SrtParser.parse(file.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello");
    }
}
