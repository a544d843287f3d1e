use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edc_rules::cache::{self, RuleCompiler};
use edc_rules::config::EngineConfig;
use edc_rules::logging::{init_logging, LogConfig};
use edc_rules::parser::parse_rule;
use edc_rules::predicate::CompiledValidator;
use edc_rules::qc::{QcEngine, SqliteStore};
use edc_rules::rule::{load_rules, Rule};
use edc_rules::sql_compiler::{SqlCompiler, SqlDialect};
use edc_rules::value::{FieldValue, RecordContext};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Parser)]
#[command(name = "edc-rules", version, about = "Compile and run clinical edit-check rules")]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true, default_value = "edc_rules.json")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a rule file and report rules that fail to compile
    Check { rules: PathBuf },
    /// Show the AST, description and SQL of one rule
    Explain {
        rule: String,
        #[arg(long, default_value = "value")]
        field: String,
        #[arg(long, default_value = "FORM")]
        form: String,
    },
    /// Validate one field value against the real-time rules bound to it
    Validate {
        rules: PathBuf,
        #[arg(long)]
        form: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        value: Option<String>,
        /// Record context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Run batch QC against a SQLite database and print the run summary
    Qc { rules: PathBuf, database: PathBuf },
    /// Interactive rule shell
    Repl,
}

/// 加载配置，失败时使用默认配置
fn load_config(path: &Path) -> EngineConfig {
    match EngineConfig::from_json_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "using default configuration");
            EngineConfig::default()
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_verbosity(cli.verbose));
    let config = load_config(&cli.config);

    match cli.command {
        Command::Check { rules } => check(&config, &rules),
        Command::Explain { rule, field, form } => explain(&config, &rule, &field, &form),
        Command::Validate {
            rules,
            form,
            field,
            value,
            context,
        } => validate(&config, &rules, &form, &field, value, context.as_deref()),
        Command::Qc { rules, database } => run_qc(config, &rules, &database),
        Command::Repl => repl(&config),
    }
}

fn read_rules(path: &Path) -> Result<Vec<Rule>> {
    load_rules(path).with_context(|| format!("loading rules from {}", path.display()))
}

fn check(config: &EngineConfig, path: &Path) -> Result<()> {
    let rules = read_rules(path)?;
    let build = RuleCompiler::from_config(config).build(&rules);
    println!("compiled {} rule(s)", build.cache().len());
    for failure in build.failures() {
        println!("  {}: {}", failure.rule_id, failure.error);
    }
    if !build.failures().is_empty() {
        bail!("{} rule(s) failed to compile", build.failures().len());
    }
    Ok(())
}

fn explain(config: &EngineConfig, text: &str, field: &str, form: &str) -> Result<()> {
    let rule = Rule::new("explain", form, field, text);
    let node = parse_rule(text).context("parsing rule")?;
    let hash = rule.content_hash();

    println!("[AST]\n{:#?}\n", node);
    println!("[canonical] {}", node);
    let validator = CompiledValidator::compile(&rule, &node, &hash)?;
    println!("[message]   {}", validator.description);

    let query = SqlCompiler::from_config(config).compile(&rule, &node, &hash)?;
    println!("\n[SQL: {:?}]\n{}", query.dialect, query.sql_template);
    println!("[bind] {:?}", query.bind_parameters.0);
    for join in &query.join_spec {
        println!("[join] {} ({:?} visit of {})", join.alias, join.visit, join.table);
    }
    Ok(())
}

fn validate(
    config: &EngineConfig,
    path: &Path,
    form: &str,
    field: &str,
    value: Option<String>,
    context: Option<&str>,
) -> Result<()> {
    let rules = read_rules(path)?;
    let handle = cache::global();
    for failure in handle.rebuild(&RuleCompiler::from_config(config), &rules) {
        warn!(rule_id = %failure.rule_id, error = %failure.error, "rule skipped");
    }

    let record: RecordContext = match context {
        Some(json) => serde_json::from_str(json).context("parsing --context")?,
        None => RecordContext::new(),
    };
    let value = value.map(FieldValue::Text).unwrap_or(FieldValue::Null);

    let outcomes = handle.snapshot().validate_field(form, field, &value, &record);
    if outcomes.is_empty() {
        println!("no real-time rules bound to {}.{}", form, field);
    }
    let mut blocked = false;
    for outcome in &outcomes {
        let passes = outcome.result.passes(config.indeterminate_policy);
        blocked |= !passes;
        println!(
            "{} [{}] {}",
            outcome.rule_id,
            outcome.severity,
            serde_json::to_string(&outcome.result)?
        );
    }
    if blocked {
        bail!("value rejected");
    }
    Ok(())
}

fn run_qc(mut config: EngineConfig, rules: &Path, database: &Path) -> Result<()> {
    if config.dialect != SqlDialect::Sqlite {
        warn!(configured = ?config.dialect, "qc runs on SQLite, overriding dialect");
        config.dialect = SqlDialect::Sqlite;
    }
    let rules = read_rules(rules)?;
    let build = RuleCompiler::from_config(&config).build(&rules);
    for failure in build.failures() {
        warn!(rule_id = %failure.rule_id, error = %failure.error, "rule skipped");
    }

    let store = SqliteStore::open(database)
        .with_context(|| format!("opening {}", database.display()))?
        .with_busy_timeout(Duration::from_secs(config.query_timeout_secs))?
        .with_query_timeout(Duration::from_secs(config.query_timeout_secs));
    let mut engine = QcEngine::from_config(store, &config);
    let summary = engine.run(build.cache());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

const REPL_HELP: &str = "\
enter a rule to see its AST and SQL, or:
  :field <name>        field the rule is bound to
  :set <name>=<value>  add a value to the record context
  :clear               empty the record context
  :check <value>       validate a value with the last rule
  :quit";

fn repl(config: &EngineConfig) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    let mut field = "value".to_string();
    let mut record = RecordContext::new();
    let mut last: Option<CompiledValidator> = None;
    println!("{}", REPL_HELP);

    loop {
        let line = match editor.readline("rule> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;

        if let Some(name) = line.strip_prefix(":field ") {
            field = name.trim().to_string();
        } else if let Some(pair) = line.strip_prefix(":set ") {
            match pair.split_once('=') {
                Some((name, value)) => {
                    record.insert(
                        name.trim().to_string(),
                        FieldValue::Text(value.trim().to_string()),
                    );
                }
                None => println!("usage: :set <name>=<value>"),
            }
        } else if line == ":clear" {
            record.clear();
        } else if let Some(value) = line.strip_prefix(":check") {
            let value = match value.trim() {
                "" => FieldValue::Null,
                text => FieldValue::Text(text.to_string()),
            };
            match &last {
                Some(validator) => println!("{:?}", validator.validate(&value, &record)),
                None => println!("no rule yet"),
            }
        } else if line == ":quit" {
            break;
        } else if line.starts_with(':') {
            println!("{}", REPL_HELP);
        } else {
            let rule = Rule::new("repl", "REPL", field.as_str(), line);
            match compile_for_repl(config, &rule) {
                Ok(validator) => last = Some(validator),
                Err(e) => println!("error: {:#}", e),
            }
        }
    }
    Ok(())
}

fn compile_for_repl(config: &EngineConfig, rule: &Rule) -> Result<CompiledValidator> {
    let node = parse_rule(&rule.rule_text)?;
    let hash = rule.content_hash();
    println!("{:#?}", node);
    let query = SqlCompiler::from_config(config).compile(rule, &node, &hash)?;
    println!("{}", query.sql_template);
    Ok(CompiledValidator::compile(rule, &node, &hash)?)
}
