use chrono::SecondsFormat;
use runledger_db::MigrationRecord;

const ERROR_PREVIEW_CHARS: usize = 48;

/// Render records as a fixed-width table for `runledger list`.
pub fn records_table(records: &[MigrationRecord]) -> String {
    if records.is_empty() {
        return "No migrations registered.\n".to_string();
    }

    let key_width = records
        .iter()
        .map(|r| r.key.len())
        .max()
        .unwrap_or(0)
        .max("KEY".len());

    let mut out = format!(
        "{:<key_width$}  {:<8}  {:>5}  {:>4}  {:<20}  {}\n",
        "KEY", "STATUS", "ORDER", "RUNS", "LAST RUN", "ERROR"
    );
    for record in records {
        let last_run = record
            .last_run_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());
        let error = record
            .error
            .as_deref()
            .map(preview)
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<key_width$}  {:<8}  {:>5}  {:>4}  {:<20}  {}\n",
            record.key,
            record.status.as_str(),
            record.order,
            record.run_count,
            last_run,
            error
        ));
    }
    out
}

/// First line of an error, cut to a readable width.
fn preview(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or_default();
    if first_line.chars().count() <= ERROR_PREVIEW_CHARS {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(ERROR_PREVIEW_CHARS - 3).collect();
    format!("{cut}...")
}
