use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use colored::*;

use crate::model::{ConversionType, ParticipantContext, Test, TestResults, TestStatus, TestType};
use crate::registry::{TemplateCustomizations, TestConfig};
use crate::service::ExperimentService;

#[derive(Parser)]
#[command(name = "abtest")]
#[command(version)]
#[command(about = "A/B testing engine for job-application experiments")]
pub struct Args {
    /// SQLite database file (overrides config and ABTEST_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List the built-in test templates
    Templates,

    /// Create a draft test from a JSON definition file
    Create {
        /// Path to the JSON test definition
        file: PathBuf,
        /// Owner of the new test
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Create a draft test from a built-in template
    FromTemplate {
        /// Template id, e.g. cover_letter_tone
        template: String,
        #[arg(long, default_value = "local")]
        owner: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Minimum participants before auto-completion
        #[arg(long)]
        min_sample: Option<u32>,
        /// Confidence level: 90, 95 or 99
        #[arg(long)]
        confidence: Option<u8>,
        /// Expected effect in percent
        #[arg(long)]
        effect: Option<f64>,
        /// Planned duration in days
        #[arg(long)]
        duration: Option<u32>,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Start a draft test
    Start { test_id: String },

    /// Pause a test
    Pause { test_id: String },

    /// Resume a paused test
    Resume { test_id: String },

    /// Run a final analysis and complete a test
    Complete { test_id: String },

    /// Archive a completed test
    Archive { test_id: String },

    /// Assign a participant to a variant
    Assign {
        test_id: String,
        participant_id: String,
        /// Scope the assignment to one application
        #[arg(long)]
        application: Option<String>,
        #[arg(long)]
        industry: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long)]
        experience_level: Option<String>,
    },

    /// Record a conversion for an assigned participant
    Convert {
        test_id: String,
        participant_id: String,
        #[arg(long, value_enum, default_value = "response")]
        kind: ConversionType,
        #[arg(long)]
        application: Option<String>,
        #[arg(long)]
        value: Option<f64>,
    },

    /// Analyse a test and store the results
    Analyze { test_id: String },

    /// List running tests
    Active {
        #[arg(long = "type", value_enum)]
        test_type: Option<TestType>,
    },

    /// List tests owned by a user
    List {
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Complete expired tests and re-check auto-completion
    Sweep,

    /// Print a test as JSON
    Show { test_id: String },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Build an audience context from CLI flags. `None` when no flag was given.
pub fn context_from_flags(
    industry: Option<String>,
    location: Option<String>,
    job_type: Option<String>,
    experience_level: Option<String>,
) -> Option<ParticipantContext> {
    if industry.is_none() && location.is_none() && job_type.is_none() && experience_level.is_none() {
        return None;
    }
    Some(ParticipantContext {
        industry,
        location,
        job_type,
        experience_level,
        ..ParticipantContext::default()
    })
}

fn status_label(status: TestStatus) -> ColoredString {
    match status {
        TestStatus::Draft => status.as_str().dimmed(),
        TestStatus::Running => status.as_str().green(),
        TestStatus::Paused => status.as_str().yellow(),
        TestStatus::Completed => status.as_str().cyan(),
        TestStatus::Archived => status.as_str().bright_black(),
    }
}

fn print_test_line(out: &mut dyn Write, test: &Test) -> std::io::Result<()> {
    writeln!(
        out,
        "{}  {:<10} {:<18} {}",
        test.id.bold(),
        status_label(test.status),
        test.test_type.as_str(),
        test.name
    )
}

fn print_results(out: &mut dyn Write, results: &TestResults) -> std::io::Result<()> {
    for v in &results.variants {
        let marker = if results.winner.as_deref() == Some(v.id.as_str()) { "*" } else { " " };
        writeln!(
            out,
            "{} {:<12} {:<28} {:>6}/{:<6} {:>6.2}%  [{:.2}, {:.2}]",
            marker,
            v.id,
            v.name,
            v.conversions,
            v.participants,
            v.conversion_rate,
            v.confidence_interval.lower,
            v.confidence_interval.upper
        )?;
    }
    let verdict = if results.statistical_significance {
        "significant".green()
    } else {
        "not significant".yellow()
    };
    writeln!(
        out,
        "p-value {:.4}  effect {:.2} pts  confidence {:.1}%  {}",
        results.p_value, results.effect_size, results.confidence, verdict
    )?;
    for r in &results.recommendations {
        writeln!(out, "  - {r}")?;
    }
    Ok(())
}

pub fn print_completions(shell: clap_complete::Shell, out: &mut dyn Write) {
    clap_complete::generate(shell, &mut Args::command(), "abtest", out);
}

/// Execute one subcommand against `service`, writing human output to `out`.
pub fn run(
    command: Command,
    service: &ExperimentService,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Templates => {
            for t in service.templates() {
                writeln!(out, "{}  {} ({} variants)", t.id.bold(), t.name, t.variants.len())?;
                writeln!(out, "    {}", t.description.dimmed())?;
            }
        }
        Command::Create { file, owner } => {
            let raw = std::fs::read_to_string(&file)?;
            let config: TestConfig = serde_json::from_str(&raw)?;
            let test = service.create_test(&owner, config)?;
            writeln!(out, "{} {}", "created".green(), test.id)?;
        }
        Command::FromTemplate {
            template,
            owner,
            name,
            description,
            min_sample,
            confidence,
            effect,
            duration,
            tags,
        } => {
            let custom = TemplateCustomizations {
                name,
                description,
                minimum_sample_size: min_sample,
                confidence_level: confidence,
                expected_effect: effect,
                duration_days: duration,
                target_audience: None,
                tags: if tags.is_empty() { None } else { Some(tags) },
            };
            let test = service.create_from_template(&owner, &template, custom)?;
            writeln!(out, "{} {}", "created".green(), test.id)?;
        }
        Command::Start { test_id } => print_test_line(out, &service.start(&test_id)?)?,
        Command::Pause { test_id } => print_test_line(out, &service.pause(&test_id)?)?,
        Command::Resume { test_id } => print_test_line(out, &service.resume(&test_id)?)?,
        Command::Complete { test_id } => {
            let test = service.complete(&test_id)?;
            print_test_line(out, &test)?;
            if let Some(results) = &test.results {
                print_results(out, results)?;
            }
        }
        Command::Archive { test_id } => print_test_line(out, &service.archive(&test_id)?)?,
        Command::Assign {
            test_id,
            participant_id,
            application,
            industry,
            location,
            job_type,
            experience_level,
        } => {
            let context = context_from_flags(industry, location, job_type, experience_level);
            let assignment =
                service.assign(&test_id, &participant_id, application.as_deref(), context)?;
            writeln!(
                out,
                "{} {} ({})",
                participant_id,
                assignment.variant_id.bold(),
                assignment.variant_name
            )?;
            writeln!(out, "{}", serde_json::to_string_pretty(&assignment.content)?)?;
        }
        Command::Convert { test_id, participant_id, kind, application, value } => {
            service.record_conversion(&test_id, &participant_id, kind, application.as_deref(), value)?;
            writeln!(out, "{} {} {}", "converted".green(), participant_id, kind)?;
        }
        Command::Analyze { test_id } => print_results(out, &service.analyze(&test_id)?)?,
        Command::Active { test_type } => {
            for test in service.list_active_tests(test_type)? {
                print_test_line(out, &test)?;
            }
        }
        Command::List { owner } => {
            for test in service.list_user_tests(&owner)? {
                print_test_line(out, &test)?;
            }
        }
        Command::Sweep => {
            let completed = service.sweep(service.now())?;
            writeln!(out, "{} test(s) completed", completed.len())?;
            for id in completed {
                writeln!(out, "  {id}")?;
            }
        }
        Command::Show { test_id } => {
            writeln!(out, "{}", serde_json::to_string_pretty(&service.get_test(&test_id)?)?)?;
        }
        Command::Completions { shell } => print_completions(shell, out),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use std::sync::Arc;

    fn service() -> ExperimentService {
        ExperimentService::new(Arc::new(InMemoryStorage::new()))
    }

    fn run_to_string(command: Command, service: &ExperimentService) -> String {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        run(command, service, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_args_parse_global_options_after_subcommand() {
        let args = Args::parse_from(["abtest", "start", "t-1", "--db", "/tmp/x.db"]);
        assert_eq!(args.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(args.config.is_none());
        assert_eq!(args.command, Command::Start { test_id: "t-1".into() });
    }

    #[test]
    fn test_args_parse_convert_defaults() {
        let args = Args::parse_from(["abtest", "convert", "t-1", "u-1"]);
        assert_eq!(
            args.command,
            Command::Convert {
                test_id: "t-1".into(),
                participant_id: "u-1".into(),
                kind: ConversionType::Response,
                application: None,
                value: None,
            }
        );
    }

    #[test]
    fn test_args_parse_from_template_tags() {
        let args = Args::parse_from([
            "abtest",
            "from-template",
            "subject_line_style",
            "--confidence",
            "99",
            "--tags",
            "email,q3",
        ]);
        match args.command {
            Command::FromTemplate { template, confidence, tags, owner, .. } => {
                assert_eq!(template, "subject_line_style");
                assert_eq!(confidence, Some(99));
                assert_eq!(tags, vec!["email".to_string(), "q3".to_string()]);
                assert_eq!(owner, "local");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_args_parse_active_type_filter() {
        let args = Args::parse_from(["abtest", "active", "--type", "subject-line"]);
        assert_eq!(args.command, Command::Active { test_type: Some(TestType::SubjectLine) });
    }

    #[test]
    fn test_context_from_flags_empty_is_none() {
        assert!(context_from_flags(None, None, None, None).is_none());
        let ctx = context_from_flags(Some("tech".into()), None, None, None).unwrap();
        assert_eq!(ctx.industry.as_deref(), Some("tech"));
        assert!(ctx.location.is_none());
    }

    #[test]
    fn test_run_template_flow() {
        let svc = service();
        let listing = run_to_string(Command::Templates, &svc);
        assert!(listing.contains("cover_letter_tone"));
        assert!(listing.contains("follow_up_timing"));

        run_to_string(
            Command::FromTemplate {
                template: "cover_letter_tone".into(),
                owner: "alice".into(),
                name: Some("Tone Q3".into()),
                description: None,
                min_sample: None,
                confidence: None,
                effect: None,
                duration: None,
                tags: vec![],
            },
            &svc,
        );
        let test = &svc.list_user_tests("alice").unwrap()[0];
        assert_eq!(test.name, "Tone Q3");

        let started = run_to_string(Command::Start { test_id: test.id.clone() }, &svc);
        assert!(started.contains("running"));

        let assigned = run_to_string(
            Command::Assign {
                test_id: test.id.clone(),
                participant_id: "u1".into(),
                application: None,
                industry: None,
                location: None,
                job_type: None,
                experience_level: None,
            },
            &svc,
        );
        assert!(assigned.contains("variant_"));

        let analysis = run_to_string(Command::Analyze { test_id: test.id.clone() }, &svc);
        assert!(analysis.contains("not significant"));
    }

    #[test]
    fn test_sweep_uses_service_clock() {
        use crate::clock::ManualClock;
        use chrono::{Duration, TimeZone, Utc};

        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let svc = service().with_clock(clock.clone());
        let test = svc
            .create_from_template(
                "alice",
                "cover_letter_tone",
                TemplateCustomizations { duration_days: Some(3), ..Default::default() },
            )
            .unwrap();
        svc.start(&test.id).unwrap();

        clock.advance(Duration::days(1));
        let early = run_to_string(Command::Sweep, &svc);
        assert!(early.contains("0 test(s) completed"));

        clock.advance(Duration::days(2));
        let due = run_to_string(Command::Sweep, &svc);
        assert!(due.contains("1 test(s) completed"));
        assert!(due.contains(&test.id));
        assert_eq!(svc.get_test(&test.id).unwrap().end_date, Some(t0 + Duration::days(3)));
    }

    #[test]
    fn test_completions_mention_subcommands() {
        let mut buf = Vec::new();
        print_completions(clap_complete::Shell::Bash, &mut buf);
        let script = String::from_utf8(buf).unwrap();
        assert!(script.contains("from-template"));
    }

    #[test]
    fn test_run_unknown_test_errors() {
        let svc = service();
        let mut buf = Vec::new();
        let err = run(Command::Show { test_id: "missing".into() }, &svc, &mut buf).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
