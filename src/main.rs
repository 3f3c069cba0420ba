pub mod models {
    pub mod knack;
    pub mod questions;
    pub mod vespa;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    #[cfg(test)]
    pub mod testing;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod bulk;
    pub mod checkpoint;
    pub mod dashboard;
    pub mod enrollment;
    pub mod establishments;
    pub mod export;
    pub mod interrupt;
    pub mod responses;
    pub mod statistics;
    pub mod students;
    pub mod sync;
    pub mod sync_log;
}

use crate::client::KnackClient;
use crate::config::Config;
use crate::models::questions::QuestionCatalogue;
use crate::models::vespa::{AcademicYear, Region};
use crate::services::checkpoint::Stage;
use crate::services::bulk::{BulkAction, Selection};
use crate::services::dashboard::{StudentFilter, StudentSort};
use crate::services::export::ExportKind;
use crate::services::{bulk, dashboard, enrollment, export, interrupt, sync};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "vespa-sync")]
#[command(author, version, about = "Sync VESPA questionnaire data from Knack into Postgres", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Load environment variables from this file (default: ./.env when present)
    #[arg(long, global = true, env = "VESPA_ENV_FILE", value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull Knack data into the database, resuming an interrupted run if one is pending
    Sync {
        /// Run a single pass even when SYNC_INTERVAL_SECS is set
        #[arg(long)]
        once: bool,
        /// Comma-separated stages to run (overrides SYNC_STAGES)
        #[arg(long, value_name = "LIST")]
        stages: Option<String>,
    },
    /// List students
    Students {
        #[arg(long)]
        establishment: Option<i64>,
        #[arg(long)]
        academic_year: Option<String>,
        #[arg(long)]
        year_group: Option<String>,
        /// Substring of name or email
        #[arg(long)]
        search: Option<String>,
        #[arg(long, value_enum, default_value_t = StudentSort::Name)]
        sort: StudentSort,
        #[arg(long)]
        desc: bool,
        #[arg(long, default_value = "50")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// One student with their establishment and full score history
    Student { email: String },
    /// Establishments with student and score counts
    Schools,
    /// Recent sync runs and any pending checkpoint
    SyncStatus {
        #[arg(long, default_value = "10")]
        limit: i64,
    },
    /// Data quality counters
    Quality,
    /// School statistics next to the national figures
    Statistics {
        #[arg(long)]
        establishment: i64,
        /// Defaults to the current academic year
        #[arg(long)]
        academic_year: Option<String>,
        #[arg(long)]
        cycle: Option<i16>,
    },
    /// Export students or scores as CSV
    Export {
        #[arg(value_enum)]
        kind: ExportKind,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Students visible to a staff admin
    Connections { staff_email: String },
    /// Change or delete a selection of students in one transaction
    Bulk {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Only report how many students would be affected
        #[arg(long)]
        dry_run: bool,
        #[command(subcommand)]
        action: BulkCommand,
    },
    /// Fill enrollment history from existing score rows
    BackfillEnrollments,
    /// Apply pending database migrations and exit
    Migrate,
}

#[derive(Args, Debug)]
struct SelectionArgs {
    #[arg(long)]
    establishment: Option<i64>,
    #[arg(long)]
    academic_year: Option<String>,
    #[arg(long)]
    year_group: Option<String>,
    /// Repeat to select several students
    #[arg(long = "email", value_name = "EMAIL")]
    emails: Vec<String>,
}

impl SelectionArgs {
    fn into_selection(self) -> Result<Selection, String> {
        let emails = self
            .emails
            .iter()
            .map(|e| models::knack::normalize_email(e).ok_or_else(|| format!("'{}' is not an email address", e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selection {
            establishment_id: self.establishment,
            academic_year: normalize_year(self.academic_year)?,
            year_group: self.year_group.map(|g| g.trim().to_string()).filter(|g| !g.is_empty()),
            emails,
        })
    }
}

#[derive(Subcommand, Debug)]
enum BulkCommand {
    /// Set the year group of every selected student
    SetYearGroup { year_group: String },
    /// Move every selected student to another academic year
    SetAcademicYear { academic_year: String },
    /// Delete the selected students with their scores and responses
    Delete {
        /// Required unless --dry-run is given
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn connect(cfg: &Config) -> Result<PgConnection, String> {
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;
    Ok(conn)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("serialize output failed: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn normalize_year(raw: Option<String>) -> Result<Option<String>, String> {
    raw.map(|y| y.parse::<AcademicYear>().map(|y| y.to_string())).transpose()
}

fn run_sync(mut cfg: Config, once: bool, stages: Option<String>) -> Result<(), String> {
    if let Some(list) = stages {
        cfg.stages = Stage::parse_list(&list)?;
    }
    if once {
        cfg.sync_interval = None;
    }
    info!(
        "Sync config (stages={}, interval={}, rps={}, max_request_retries={}, checkpoint={})",
        cfg.stages.iter().map(Stage::as_str).collect::<Vec<_>>().join(","),
        cfg.sync_interval
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "once".to_string()),
        cfg.requests_per_second
            .map(|v| v.get().to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.max_request_retries,
        cfg.checkpoint_file.display()
    );

    let credentials = cfg.knack_credentials()?;
    let catalogue = match &cfg.question_mapping_file {
        Some(path) => QuestionCatalogue::from_file(path)?,
        None => QuestionCatalogue::builtin()?,
    };
    let categories: std::collections::BTreeSet<&str> = catalogue.iter().map(|q| q.category.as_str()).collect();
    info!(
        "Question catalogue: {} questions in {} categories",
        catalogue.len(),
        categories.len()
    );

    let stop = interrupt::install()?;
    let mut conn = connect(&cfg)?;
    let client = KnackClient::new(
        cfg.knack_base_url.as_str(),
        credentials,
        cfg.max_request_retries,
        cfg.requests_per_second,
    );
    sync::run(&mut conn, &client, &cfg, &catalogue, &stop)
}

fn run(command: Command) -> Result<(), String> {
    let cfg = Config::from_env()?;

    match command {
        Command::Sync { once, stages } => run_sync(cfg, once, stages),
        Command::Migrate => connect(&cfg).map(|_| ()),
        Command::BackfillEnrollments => {
            let mut conn = connect(&cfg)?;
            let inserted = sync::in_transaction(&mut conn, enrollment::backfill)?;
            print_json(&serde_json::json!({ "inserted": inserted }))
        }
        Command::Students {
            establishment,
            academic_year,
            year_group,
            search,
            sort,
            desc,
            limit,
            offset,
        } => {
            if limit <= 0 || offset < 0 {
                return Err("--limit must be positive and --offset non-negative".to_string());
            }
            let filter = StudentFilter {
                establishment_id: establishment,
                academic_year: normalize_year(academic_year)?,
                year_group,
                search,
                sort,
                descending: desc,
                limit,
                offset,
            };
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::students(&mut conn, &filter)?)
        }
        Command::Student { email } => {
            let email = models::knack::normalize_email(&email)
                .ok_or_else(|| format!("'{}' is not an email address", email))?;
            let mut conn = connect(&cfg)?;
            let detail = dashboard::student_detail(&mut conn, &email)?
                .ok_or_else(|| format!("no student with email {}", email))?;
            print_json(&detail)
        }
        Command::Schools => {
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::schools(&mut conn)?)
        }
        Command::SyncStatus { limit } => {
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::sync_status(&mut conn, &cfg.checkpoint_file, limit.max(1))?)
        }
        Command::Quality => {
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::quality(&mut conn)?)
        }
        Command::Statistics {
            establishment,
            academic_year,
            cycle,
        } => {
            let year = match normalize_year(academic_year)? {
                Some(y) => y,
                None => AcademicYear::for_date(Utc::now().date_naive(), Region::Standard).to_string(),
            };
            if let Some(c) = cycle {
                models::vespa::Cycle::try_from(c)?;
            }
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::statistics(&mut conn, establishment, &year, cycle)?)
        }
        Command::Export { kind, output } => {
            let mut conn = connect(&cfg)?;
            let rows = match &output {
                Some(path) => {
                    let file = std::fs::File::create(path)
                        .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
                    let mut out = std::io::BufWriter::new(file);
                    export::export(&mut conn, kind, &mut out)?
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut out = stdout.lock();
                    let rows = export::export(&mut conn, kind, &mut out)?;
                    out.flush().map_err(|e| format!("write export failed: {}", e))?;
                    rows
                }
            };
            info!("Exported {} {:?} rows", rows, kind);
            Ok(())
        }
        Command::Connections { staff_email } => {
            let email = models::knack::normalize_email(&staff_email)
                .ok_or_else(|| format!("'{}' is not an email address", staff_email))?;
            let mut conn = connect(&cfg)?;
            print_json(&dashboard::connected_students(&mut conn, &email)?)
        }
        Command::Bulk {
            selection,
            dry_run,
            action,
        } => {
            let selection = selection.into_selection()?;
            let action = match action {
                BulkCommand::SetYearGroup { year_group } => BulkAction::set_year_group(&year_group)?,
                BulkCommand::SetAcademicYear { academic_year } => {
                    BulkAction::SetAcademicYear(academic_year.parse::<AcademicYear>()?)
                }
                BulkCommand::Delete { yes } => {
                    if !yes && !dry_run {
                        return Err("bulk delete needs --yes (or --dry-run to preview)".to_string());
                    }
                    BulkAction::Delete
                }
            };
            let mut conn = connect(&cfg)?;
            print_json(&bulk::apply(&mut conn, &selection, &action, dry_run)?)
        }
    }
}

fn configure_env(explicit: Option<&Path>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.to_path_buf(),
            explicit: true,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        load_env_file(&default_path)?;
        Ok(Some(LoadedEnvFile {
            path: default_path,
            explicit: false,
        }))
    } else {
        Ok(None)
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse_env_file(&contents).map_err(|e| format!("{}:{}", path.display(), e))? {
        // Variables already set in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Assignments in file order; errors carry the 1-based line number.
fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        match parse_env_assignment(line) {
            Ok(Some(pair)) => out.push(pair),
            Ok(None) => {}
            Err(e) => return Err(format!("{}: {}", index + 1, e)),
        }
    }
    Ok(out)
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let (key, value_part) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_env_value(value_part)?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_quoted(rest, '"', true)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_quoted(rest, '\'', false)
    } else {
        // Unquoted values end at an inline comment.
        let value = trimmed.split_once(" #").map_or(trimmed, |(v, _)| v);
        Ok(value.trim_end().to_string())
    }
}

/// Double quotes honour backslash escapes; single quotes are literal.
fn parse_quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            result.push(match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escape = false;
        } else if escapes && ch == '\\' {
            escape = true;
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote))
            };
        } else {
            result.push(ch);
        }
    }

    Err(format!("unterminated {}-quoted value", quote))
}

fn main() {
    let cli = Cli::parse();

    let loaded_env = match configure_env(cli.env_file.as_deref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "vespa-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn bulk_selection_is_normalized() {
        let cli = Cli::try_parse_from([
            "vespa-sync",
            "bulk",
            "--establishment",
            "3",
            "--academic-year",
            "2025-26",
            "--email",
            " Amy.UK@Example.ac.uk ",
            "--dry-run",
            "set-year-group",
            "Year 13",
        ])
        .unwrap();
        let Command::Bulk {
            selection,
            dry_run,
            action,
        } = cli.command
        else {
            panic!("expected the bulk command");
        };
        assert!(dry_run);
        assert!(matches!(action, BulkCommand::SetYearGroup { ref year_group } if year_group == "Year 13"));
        let selection = selection.into_selection().unwrap();
        assert_eq!(selection.establishment_id, Some(3));
        assert_eq!(selection.academic_year.as_deref(), Some("2025/2026"));
        assert_eq!(selection.emails, vec!["amy.uk@example.ac.uk".to_string()]);
    }

    #[test]
    fn env_comments_blank_lines_and_export() {
        let parsed = parse_env_file(
            "# Knack\n\nexport KNACK_APP_ID=abc123\nSYNC_STAGES = students,statistics # nightly\nEMPTY=\n",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("KNACK_APP_ID".to_string(), "abc123".to_string()),
                ("SYNC_STAGES".to_string(), "students,statistics".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn env_quoted_values() {
        assert_eq!(parse_env_value(r#""a \"b\"\tc" # note"#).unwrap(), "a \"b\"\tc");
        assert_eq!(parse_env_value(r"'raw \n value'").unwrap(), r"raw \n value");
        assert_eq!(
            parse_env_value("postgres://u:p@h/db#frag").unwrap(),
            "postgres://u:p@h/db#frag"
        );
    }

    #[test]
    fn env_errors_carry_line_numbers() {
        let err = parse_env_file("A=1\nNOT AN ASSIGNMENT\n").unwrap_err();
        assert!(err.starts_with("2: "), "{}", err);
        assert!(parse_env_value("\"open").is_err());
        assert!(parse_env_value("'x' trailing").is_err());
        assert!(parse_env_assignment("BAD KEY=1").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "vespa-sync",
            "students",
            "--academic-year",
            "2025-26",
            "--sort",
            "year-group",
            "--desc",
        ])
        .unwrap();
        match cli.command {
            Command::Students {
                academic_year,
                sort,
                desc,
                limit,
                ..
            } => {
                assert_eq!(normalize_year(academic_year).unwrap().as_deref(), Some("2025/2026"));
                assert_eq!(sort, StudentSort::YearGroup);
                assert!(desc);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["vespa-sync", "--env-file", "prod.env", "export", "scores", "-o", "s.csv"]).unwrap();
        assert_eq!(cli.env_file.as_deref(), Some(Path::new("prod.env")));
        assert!(matches!(cli.command, Command::Export { kind: ExportKind::Scores, .. }));
    }
}
