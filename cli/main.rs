#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;

use rune::aggregate::{PredictionRequest, PredictionResult, RiskAggregator};
use rune::assets::ModelAssets;
use rune::config::EngineConfig;
use rune::schema::CaseInput;

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the model asset bundle (.toml)
    #[arg(long)]
    pub assets: PathBuf,

    /// Path to one case (.toml) with clinical field names
    #[arg(long)]
    pub case: PathBuf,

    /// Identifier reported with the result and used to derive the seed
    #[arg(long, default_value = "case")]
    pub id: String,

    /// Seed for all draws; derived from the identifier when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Optional engine configuration (.toml) overriding the default draw counts
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the risk samples as TSV
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct BatchArgs {
    /// Path to the model asset bundle (.toml)
    #[arg(long)]
    pub assets: PathBuf,

    /// TSV of cases: an `identifier` column, an optional `seed` column and one
    /// column per clinical field. Leave lactate or albumin empty when not measured.
    #[arg(long)]
    pub cases: PathBuf,

    /// Optional engine configuration (.toml) overriding the default draw counts
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the per-case summary TSV
    #[arg(long, default_value = "risk_summary.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "rune",
    about = "Operative-mortality risk from multiply-imputed additive-model experts",
    long_about = "Scores emergency laparotomy cases against fitted mortality and marker \
                 imputation experts, reporting the full posterior risk distribution."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a single case and print the result as JSON
    Predict(PredictArgs),
    /// Score a TSV of cases in parallel
    Batch(BatchArgs),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Batch(args)) => batch(args),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    let assets = ModelAssets::load(&args.assets, &config)?;
    let aggregator = RiskAggregator::new(&assets, config)?;

    let case: CaseInput = toml::from_str(&fs::read_to_string(&args.case)?)?;
    let request = PredictionRequest::new(args.id, case, args.seed);
    let result = aggregator.predict(&request)?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(output) = args.output {
        save_samples(&result, &output)?;
        eprintln!("Risk samples saved to: {}", output.display());
    }
    Ok(())
}

fn save_samples(result: &PredictionResult, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["sample", "risk"])?;
    for (i, risk) in result.samples.iter().enumerate() {
        writer.write_record([i.to_string(), risk.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct SummaryRow {
    identifier: String,
    seed: Option<u64>,
    path: String,
    imputed: String,
    n_samples: usize,
    median: Option<f64>,
    lower: Option<f64>,
    upper: Option<f64>,
    error: String,
}

pub fn batch(args: BatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    let assets = ModelAssets::load(&args.assets, &config)?;
    let aggregator = RiskAggregator::new(&assets, config)?;

    let requests = read_cases(&args.cases)?;
    eprintln!("Loaded {} cases from {}", requests.len(), args.cases.display());
    let outcomes = aggregator.predict_batch(&requests);

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&args.output)?;
    let mut failures = 0;
    for (request, outcome) in requests.iter().zip(outcomes) {
        let row = match outcome {
            Ok(result) => SummaryRow {
                identifier: result.identifier,
                seed: Some(result.seed),
                path: format!("{:?}", result.path).to_lowercase(),
                imputed: result
                    .imputed
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                n_samples: result.samples.len(),
                median: Some(result.summary.median),
                lower: Some(result.summary.lower),
                upper: Some(result.summary.upper),
                error: String::new(),
            },
            Err(e) => {
                failures += 1;
                SummaryRow {
                    identifier: request.identifier.clone(),
                    seed: Some(request.seed),
                    path: "failed".to_string(),
                    imputed: String::new(),
                    n_samples: 0,
                    median: None,
                    lower: None,
                    upper: None,
                    error: e.to_string(),
                }
            }
        };
        writer.serialize(row)?;
    }
    writer.flush()?;

    eprintln!(
        "Scored {} cases ({failures} failed). Summary saved to: {}",
        requests.len(),
        args.output.display()
    );
    Ok(())
}

fn read_cases(path: &PathBuf) -> Result<Vec<PredictionRequest>, Box<dyn std::error::Error>> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_index = headers
        .iter()
        .position(|h| h == "identifier")
        .ok_or("case file has no 'identifier' column")?;
    let seed_index = headers.iter().position(|h| h == "seed");

    let mut requests = Vec::new();
    for record in reader.records() {
        let record = record?;
        let case: CaseInput = record.deserialize(Some(&headers))?;
        let identifier = record.get(id_index).unwrap_or_default().to_string();
        let seed = match seed_index.and_then(|i| record.get(i)) {
            Some(text) if !text.trim().is_empty() => Some(text.trim().parse::<u64>()?),
            _ => None,
        };
        requests.push(PredictionRequest::new(identifier, case, seed));
    }
    Ok(requests)
}
