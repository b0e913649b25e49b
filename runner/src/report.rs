use crate::{
    pipeline::{PipelineState, PipelineSummary},
    result::{ResultSet, RunResult},
    util::format_duration,
};
use serde::Serialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report {}", path.to_string_lossy())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize report")]
    Serialization(#[from] serde_json::Error),
}

fn write(path: PathBuf, content: String) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ReportError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&path, content).map_err(|source| ReportError::Write { path, source })
}

fn score_cell(score: Option<&f64>) -> String {
    score.map_or_else(|| "-".to_owned(), |score| format!("{score:.4}"))
}

/// Ranked table of a result set with its time accounting in front
pub fn render_table(set: &ResultSet) -> String {
    let mut text = String::new();

    // writing into a String cannot fail
    let _ = writeln!(text, "Longest time:    {}", format_duration(set.longest_elapsed));
    let _ = writeln!(text, "Overall time:    {}", format_duration(set.overall_elapsed));
    let _ = writeln!(text, "Submitted tasks: {}", set.submitted_count);
    if set.survived_count != set.submitted_count {
        let _ = writeln!(text, "Survived tasks:  {}", set.survived_count);
    }
    let _ = writeln!(
        text,
        "\n{:>4} {:>14} {:>9} {:>14} {:>14} tree",
        "rank", "score", "time", "startscore", "endscore"
    );

    for (rank, result) in set.results.iter().enumerate() {
        let _ = writeln!(
            text,
            "{:>4} {:>14.4} {:>9} {:>14} {:>14} {}",
            rank + 1,
            result.score,
            format_duration(result.elapsed),
            score_cell(result.start_scores.first()),
            score_cell(result.start_scores.last()),
            result.tree.to_string_lossy()
        );
    }

    text
}

/// `result.<stage>.txt` and `result.<stage>.json` in `dir`
pub fn write_stage(dir: &Path, stage: &str, set: &ResultSet) -> Result<(), ReportError> {
    write(dir.join(format!("result.{stage}.txt")), render_table(set))?;
    write(
        dir.join(format!("result.{stage}.json")),
        serde_json::to_string_pretty(set)?,
    )?;
    info!(
        stage = stage,
        best = set.best().score,
        tree = %set.best().tree.to_string_lossy(),
        "Wrote stage report"
    );

    Ok(())
}

#[serde_as]
#[derive(Serialize)]
struct BestRecord<'a> {
    #[serde(flatten)]
    result: &'a RunResult,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    longest_elapsed: Duration,
    longest_elapsed_text: String,
}

#[serde_as]
#[derive(Serialize)]
struct Total<'a> {
    final_stage: &'a str,
    score: f64,
    tree: &'a Path,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    longest_elapsed: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    overall_elapsed: Duration,
}

#[derive(Serialize)]
struct AllRecord<'a> {
    total: Total<'a>,
    stages: BTreeMap<&'a str, &'a ResultSet>,
}

/// `result.best.json`, `result.all.json` and `result.all.txt` of a completed pipeline
pub fn write_summary(
    dir: &Path,
    summary: &PipelineSummary,
    stage_results: &BTreeMap<String, ResultSet>,
) -> Result<(), ReportError> {
    let best = BestRecord {
        result: &summary.best,
        longest_elapsed: summary.longest_elapsed,
        longest_elapsed_text: format_duration(summary.longest_elapsed),
    };
    write(
        dir.join("result.best.json"),
        serde_json::to_string_pretty(&best)?,
    )?;

    let all = AllRecord {
        total: Total {
            final_stage: &summary.final_stage,
            score: summary.best.score,
            tree: &summary.best.tree,
            longest_elapsed: summary.longest_elapsed,
            overall_elapsed: summary.overall_elapsed,
        },
        stages: stage_results
            .iter()
            .map(|(stage, set)| (stage.as_str(), set))
            .collect(),
    };
    write(
        dir.join("result.all.json"),
        serde_json::to_string_pretty(&all)?,
    )?;

    write(
        dir.join("result.all.txt"),
        format!(
            "Overall time: {}\nWall clock:   {}\nFinal stage:  {}\nScore:        {}\nTree:         {}\n",
            format_duration(summary.longest_elapsed),
            format_duration(summary.overall_elapsed),
            summary.final_stage,
            summary.best.score,
            summary.best.tree.to_string_lossy()
        ),
    )?;
    info!(
        score = summary.best.score,
        longest = %format_duration(summary.longest_elapsed),
        tree = %summary.best.tree.to_string_lossy(),
        "Wrote pipeline summary"
    );

    Ok(())
}

/// Regenerate every report derivable from a persisted pipeline into `dir`.
pub fn write_all(dir: &Path, state: &PipelineState) -> Result<usize, ReportError> {
    let mut written = 0;

    for (stage, set) in &state.stage_results {
        write_stage(dir, stage, set)?;
        written += 2;
    }
    if let Some(ref summary) = state.summary {
        write_summary(dir, summary, &state.stage_results)?;
        written += 3;
    }

    Ok(written)
}
