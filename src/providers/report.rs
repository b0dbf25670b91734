//! Markdown report writer. One `<content id>.md` per video.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::{ReportInput, ReportRenderer};

#[derive(Debug, Default)]
pub struct MarkdownReport;

fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Short human line for a frame analysis blob: its `description` field when
/// present, compact JSON otherwise.
fn describe_analysis(analysis: &serde_json::Value) -> String {
    analysis
        .get("description")
        .and_then(|d| d.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| analysis.to_string())
}

pub fn render_markdown(input: &ReportInput) -> String {
    let mut out = String::new();
    let video = &input.video;

    let _ = writeln!(out, "# {}\n", video.name);
    let _ = writeln!(out, "- Content id: `{}`", video.content_id);
    if let Some(duration) = video.duration_seconds {
        let _ = writeln!(out, "- Duration: {}", format_timestamp(duration));
    }
    let counts = input.frame_counts;
    let _ = writeln!(
        out,
        "- Frames analyzed: {} of {} ({} failed)\n",
        counts.completed,
        counts.total(),
        counts.failed
    );

    if let Some(summary) = &input.summary {
        let _ = writeln!(out, "## Summary\n\n{}\n", summary.text.trim());
        if !summary.key_points.is_empty() {
            let _ = writeln!(out, "### Key points\n");
            for point in &summary.key_points {
                let _ = writeln!(out, "- {}", point);
            }
            out.push('\n');
        }
    }

    if !input.analyzed_frames.is_empty() {
        let _ = writeln!(out, "## Visual timeline\n");
        for frame in &input.analyzed_frames {
            if let Some(analysis) = &frame.analysis {
                let _ = writeln!(
                    out,
                    "- **{}** {}",
                    format_timestamp(frame.timestamp_seconds),
                    describe_analysis(analysis)
                );
            }
        }
        out.push('\n');
    }

    if let Some(quiz) = &input.quiz {
        let _ = writeln!(out, "## Quiz\n");
        for (n, question) in quiz.questions.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", n + 1, question.question);
            for (i, option) in question.options.iter().enumerate() {
                let marker = if i == question.answer_index { "x" } else { " " };
                let _ = writeln!(out, "   - [{}] {}", marker, option);
            }
        }
        out.push('\n');
    }

    if !input.transcript.is_empty() {
        let _ = writeln!(out, "## Transcript\n");
        for segment in &input.transcript {
            let _ = writeln!(
                out,
                "[{}] {}",
                format_timestamp(segment.start_time),
                segment.text
            );
        }
    }

    out
}

#[async_trait]
impl ReportRenderer for MarkdownReport {
    async fn render(&self, input: &ReportInput, out_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create report dir {:?}", out_dir))?;
        let path = out_dir.join(format!(
            "{}.md",
            super::gateway::safe_file_name(&input.video.content_id)
        ));
        tokio::fs::write(&path, render_markdown(input))
            .await
            .with_context(|| format!("Failed to write report {:?}", path))?;
        log::info!("Report written to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{FrameCounts, Quiz, QuizQuestion, Summary, Video};

    fn video() -> Video {
        Video {
            id: 1,
            content_id: "bafy1".to_string(),
            name: "Intro to Rust".to_string(),
            local_path: None,
            audio_path: None,
            duration_seconds: Some(3725.0),
            has_transcription: true,
            has_frame_analysis: true,
            has_summary: true,
            has_quiz: true,
            processed: false,
            processing: true,
            last_error: None,
            last_error_at: None,
            report_path: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(65.9), "01:05");
        assert_eq!(format_timestamp(3725.0), "1:02:05");
        assert_eq!(format_timestamp(-1.0), "00:00");
    }

    #[test]
    fn test_markdown_marks_correct_answer() {
        let input = ReportInput {
            video: video(),
            summary: Some(Summary {
                video_id: 1,
                text: "Ownership explained.".to_string(),
                key_points: vec!["Borrowing".to_string()],
                created_at: String::new(),
            }),
            quiz: Some(Quiz {
                video_id: 1,
                questions: vec![QuizQuestion {
                    question: "Who owns a value?".to_string(),
                    options: vec!["Nobody".to_string(), "One binding".to_string()],
                    answer_index: 1,
                }],
                created_at: String::new(),
            }),
            transcript: Vec::new(),
            frame_counts: FrameCounts {
                completed: 6,
                failed: 4,
                ..Default::default()
            },
            analyzed_frames: Vec::new(),
        };

        let markdown = render_markdown(&input);
        assert!(markdown.starts_with("# Intro to Rust"));
        assert!(markdown.contains("- Duration: 1:02:05"));
        assert!(markdown.contains("Frames analyzed: 6 of 10 (4 failed)"));
        assert!(markdown.contains("- [x] One binding"));
        assert!(markdown.contains("- [ ] Nobody"));
        assert!(!markdown.contains("## Transcript"));
    }
}
