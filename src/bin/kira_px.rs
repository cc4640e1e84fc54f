use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kira_proteomics_explorer::annotation::UniprotHttpClient;
use kira_proteomics_explorer::app::{App, ListEdit};
use kira_proteomics_explorer::config::{
    ColumnMapping, ConfigLoader, DatasetSource, GenericExtraField, ResolvedConfig,
    TransformOptions,
};
use kira_proteomics_explorer::domain::{DatasetId, HexColor, SearchType};
use kira_proteomics_explorer::error::KiraError;
use kira_proteomics_explorer::output::{JsonOutput, LogProgress};
use kira_proteomics_explorer::store::{FsStorage, Store};
use kira_proteomics_explorer::volcano::VolcanoSettings;

#[derive(Parser)]
#[command(name = "kira-px")]
#[command(about = "Protein search and volcano-plot analytics for proteomics datasets")]
#[command(version, author)]
struct Cli {
    /// Project config (defaults to ./kira-px.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand, about = "Import and manage datasets")]
    Dataset(DatasetCommand),
    #[command(subcommand, about = "Manage alias indices")]
    Index(IndexCommand),
    #[command(about = "Fetch UniProt annotations for a dataset")]
    Annotate(DatasetArg),
    #[command(about = "Batch search proteins")]
    Search(SearchArgs),
    #[command(about = "Typeahead suggestions")]
    Suggest(SuggestArgs),
    #[command(about = "Build the volcano-plot payload")]
    Volcano(VolcanoArgs),
    #[command(about = "Save search matches as a named search list")]
    Select(SelectArgs),
    #[command(subcommand, about = "Inspect and edit search lists")]
    List(ListCommand),
}

#[derive(Subcommand)]
enum DatasetCommand {
    #[command(about = "Import raw and processed tables")]
    Import(ImportArgs),
    #[command(about = "List imported datasets")]
    List,
    #[command(about = "Show dataset info")]
    Info(DatasetArg),
    #[command(about = "Remove one dataset")]
    Remove(DatasetArg),
    #[command(about = "Clear project-local store")]
    Clear,
}

#[derive(Subcommand)]
enum IndexCommand {
    #[command(about = "Build the alias index")]
    Build(IndexBuildArgs),
}

#[derive(Args)]
struct IndexBuildArgs {
    dataset: String,

    /// Rebuild even when an index already exists.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DatasetArg {
    dataset: String,
}

#[derive(Args)]
struct ImportArgs {
    dataset: String,

    #[arg(long)]
    raw: Option<PathBuf>,

    #[arg(long)]
    processed: Option<PathBuf>,

    /// Primary id column; when given, column flags replace the config mapping.
    #[arg(long)]
    primary_id: Option<String>,

    #[arg(long)]
    gene_names: Option<String>,

    #[arg(long)]
    fold_change: Option<String>,

    #[arg(long)]
    significance: Option<String>,

    #[arg(long)]
    comparison: Option<String>,

    #[arg(long, value_delimiter = ',')]
    samples: Vec<String>,

    #[arg(long)]
    log2_fold_change: bool,

    #[arg(long)]
    neg_log10_significance: bool,

    #[arg(long)]
    reverse_fold_change: bool,

    #[arg(long)]
    no_index: bool,
}

#[derive(Args)]
struct SearchArgs {
    dataset: String,

    #[arg(long = "type", value_enum, default_value = "primary-id")]
    search_type: SearchType,

    /// Treat every line as a case-insensitive pattern.
    #[arg(long)]
    regex: bool,

    /// Read terms from a file, one group per line.
    #[arg(long)]
    input: Option<PathBuf>,

    terms: Vec<String>,
}

#[derive(Args)]
struct SuggestArgs {
    dataset: String,

    query: String,

    #[arg(long = "type", value_enum, default_value = "gene-name")]
    search_type: SearchType,

    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Args)]
struct VolcanoArgs {
    dataset: String,

    #[arg(long)]
    p_cutoff: Option<f64>,

    #[arg(long)]
    fc_cutoff: Option<f64>,

    #[arg(long)]
    grey_background: bool,

    #[arg(long)]
    cap: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct SelectArgs {
    dataset: String,

    name: String,

    #[arg(long = "type", value_enum, default_value = "primary-id")]
    search_type: SearchType,

    #[arg(long)]
    description: Option<String>,

    #[arg(long)]
    input: Option<PathBuf>,

    terms: Vec<String>,
}

#[derive(Subcommand)]
enum ListCommand {
    #[command(about = "Show search lists and filtered proteins")]
    Show(DatasetArg),
    #[command(about = "Remove a search list")]
    Remove(ListArg),
    #[command(about = "Rename a search list")]
    Rename(RenameArgs),
    #[command(about = "Change a search list color")]
    Recolor(RecolorArgs),
    #[command(about = "Toggle the filter of a search list")]
    Filter(ListArg),
    #[command(about = "Toggle the filter of a stored selection")]
    FilterStored(StoredArgs),
    #[command(about = "Replace the active filters")]
    SetFilters(SetFiltersArgs),
    #[command(about = "Remove every search list")]
    Clear(DatasetArg),
    #[command(about = "Print the selection map with search lists folded in")]
    Export(DatasetArg),
    #[command(about = "Merge a selection map file into the dataset")]
    Import(ImportSelectionsArgs),
}

#[derive(Args)]
struct SetFiltersArgs {
    dataset: String,

    #[arg(long = "list")]
    lists: Vec<Uuid>,

    #[arg(long = "stored")]
    stored: Vec<String>,
}

#[derive(Args)]
struct ImportSelectionsArgs {
    dataset: String,
    file: PathBuf,
}

#[derive(Args)]
struct ListArg {
    dataset: String,
    list: Uuid,
}

#[derive(Args)]
struct RenameArgs {
    dataset: String,
    list: Uuid,
    name: String,
}

#[derive(Args)]
struct RecolorArgs {
    dataset: String,
    list: Uuid,
    color: String,
}

#[derive(Args)]
struct StoredArgs {
    dataset: String,
    name: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::DatasetNotFound(_)
        | KiraError::MissingConfig
        | KiraError::IndexNotBuilt(_)
        | KiraError::SearchListNotFound(_)
        | KiraError::SelectionNameTaken(_) => 2,
        KiraError::UniprotHttp(_) | KiraError::UniprotStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store = Store::new()?;
    let annotation = UniprotHttpClient::new()?;
    let app = App::new(FsStorage::new(store), annotation);
    let sink = LogProgress;

    match cli.command {
        Commands::Dataset(command) => match command {
            DatasetCommand::Import(args) => {
                let id = parse_dataset(&args.dataset)?;
                let (source, extra) = import_source(&id, &args, config.as_ref())?;
                let result = app.import(&id, &source, extra, !args.no_index, &sink)?;
                JsonOutput::print_import(&result).into_diagnostic()
            }
            DatasetCommand::List => {
                let result = app.list(&sink)?;
                JsonOutput::print_list(&result).into_diagnostic()
            }
            DatasetCommand::Info(args) => {
                let result = app.info(&parse_dataset(&args.dataset)?, &sink)?;
                JsonOutput::print_info(&result).into_diagnostic()
            }
            DatasetCommand::Remove(args) => {
                let id = parse_dataset(&args.dataset)?;
                let result = app.clear(Some(&id), &sink)?;
                JsonOutput::print_clear(&result).into_diagnostic()
            }
            DatasetCommand::Clear => {
                let result = app.clear(None, &sink)?;
                JsonOutput::print_clear(&result).into_diagnostic()
            }
        },
        Commands::Index(IndexCommand::Build(args)) => {
            let result = app.build_index(&parse_dataset(&args.dataset)?, args.force, &sink)?;
            JsonOutput::print_index(&result).into_diagnostic()
        }
        Commands::Annotate(args) => {
            let result = app.annotate(&parse_dataset(&args.dataset)?, &sink)?;
            JsonOutput::print_annotate(&result).into_diagnostic()
        }
        Commands::Search(args) => {
            let id = parse_dataset(&args.dataset)?;
            let lines = collect_terms(args.input.as_ref(), args.terms)?;
            let result = app.search(&id, &lines, args.search_type, args.regex, &sink)?;
            JsonOutput::print_search(&result).into_diagnostic()
        }
        Commands::Suggest(args) => {
            let id = parse_dataset(&args.dataset)?;
            let result = app.suggest(&id, &args.query, args.search_type, args.limit)?;
            JsonOutput::print_suggest(&result).into_diagnostic()
        }
        Commands::Volcano(args) => {
            let id = parse_dataset(&args.dataset)?;
            let mut settings = config
                .map(|config| config.volcano)
                .unwrap_or_else(VolcanoSettings::default);
            if let Some(p_cutoff) = args.p_cutoff {
                settings.p_cutoff = p_cutoff;
            }
            if let Some(fc_cutoff) = args.fc_cutoff {
                settings.fc_cutoff = fc_cutoff;
            }
            if args.grey_background {
                settings.grey_background = true;
            }
            if let Some(cap) = args.cap {
                settings.background_cap = cap;
            }
            if args.seed.is_some() {
                settings.sample_seed = args.seed;
            }
            let result = app.volcano(&id, &settings, &sink)?;
            JsonOutput::print_volcano(&result).into_diagnostic()
        }
        Commands::Select(args) => {
            let id = parse_dataset(&args.dataset)?;
            let lines = collect_terms(args.input.as_ref(), args.terms)?;
            let result = app.select(
                &id,
                &args.name,
                &lines,
                args.search_type,
                args.description,
                &sink,
            )?;
            JsonOutput::print_select(&result).into_diagnostic()
        }
        Commands::List(command) => {
            let (dataset, edit) = match command {
                ListCommand::Show(args) => {
                    let result = app.lists(&parse_dataset(&args.dataset)?)?;
                    return JsonOutput::print_lists(&result).into_diagnostic();
                }
                ListCommand::Export(args) => {
                    let result = app.export_selections(&parse_dataset(&args.dataset)?)?;
                    return JsonOutput::print_selections(&result).into_diagnostic();
                }
                ListCommand::Import(args) => {
                    let result = app.import_selections(&parse_dataset(&args.dataset)?, &args.file)?;
                    return JsonOutput::print_lists(&result).into_diagnostic();
                }
                ListCommand::Remove(args) => (args.dataset, ListEdit::Remove(args.list)),
                ListCommand::Rename(args) => (args.dataset, ListEdit::Rename(args.list, args.name)),
                ListCommand::Recolor(args) => {
                    let color: HexColor = args.color.parse()?;
                    (args.dataset, ListEdit::Recolor(args.list, color))
                }
                ListCommand::Filter(args) => (args.dataset, ListEdit::ToggleFilter(args.list)),
                ListCommand::FilterStored(args) => (args.dataset, ListEdit::ToggleStored(args.name)),
                ListCommand::SetFilters(args) => (
                    args.dataset,
                    ListEdit::SetFilters {
                        lists: args.lists,
                        stored: args.stored,
                    },
                ),
                ListCommand::Clear(args) => (args.dataset, ListEdit::Clear),
            };
            let result = app.edit_list(&parse_dataset(&dataset)?, edit)?;
            JsonOutput::print_lists(&result).into_diagnostic()
        }
    }
}

fn parse_dataset(value: &str) -> Result<DatasetId, KiraError> {
    value.parse()
}

/// An explicit path must load; the default path is optional.
fn load_config(path: Option<&str>) -> Result<Option<ResolvedConfig>, KiraError> {
    match ConfigLoader::resolve(path) {
        Ok(config) => Ok(Some(config)),
        Err(KiraError::MissingConfig) => Ok(None),
        Err(err) => Err(err),
    }
}

fn collect_terms(input: Option<&PathBuf>, terms: Vec<String>) -> Result<Vec<String>, KiraError> {
    let mut lines = terms;
    if let Some(path) = input {
        let content = fs::read_to_string(path)
            .map_err(|err| KiraError::Filesystem(format!("read {}: {err}", path.display())))?;
        lines.extend(content.lines().map(str::to_string));
    }
    Ok(lines)
}

fn import_source(
    id: &DatasetId,
    args: &ImportArgs,
    config: Option<&ResolvedConfig>,
) -> Result<(DatasetSource, BTreeMap<String, GenericExtraField>), KiraError> {
    let request = config.and_then(|config| config.dataset(id));
    let configured = request.and_then(|request| request.source.as_ref());
    let extra = request
        .map(|request| request.extra.clone())
        .unwrap_or_default();

    let columns = match (&args.primary_id, configured) {
        (Some(primary_id), _) => ColumnMapping {
            primary_id: primary_id.clone(),
            raw_primary_id: None,
            gene_names: args.gene_names.clone(),
            fold_change: args.fold_change.clone(),
            significance: args.significance.clone(),
            comparison: args.comparison.clone(),
            samples: args.samples.clone(),
        },
        (None, Some(source)) => source.columns.clone(),
        (None, None) => {
            return Err(KiraError::ConfigParse(format!(
                "no column mapping for dataset {id}; pass --primary-id or add it to kira-px.json"
            )));
        }
    };
    let missing = |what: &str| {
        KiraError::ConfigParse(format!("no {what} table for dataset {id}; pass --{what}"))
    };
    let raw = args
        .raw
        .clone()
        .or_else(|| configured.map(|source| source.raw.clone()))
        .ok_or_else(|| missing("raw"))?;
    let processed = args
        .processed
        .clone()
        .or_else(|| configured.map(|source| source.processed.clone()))
        .ok_or_else(|| missing("processed"))?;

    let base = configured
        .map(|source| source.transforms)
        .unwrap_or_default();
    let transforms = TransformOptions {
        log2_fold_change: base.log2_fold_change || args.log2_fold_change,
        neg_log10_significance: base.neg_log10_significance || args.neg_log10_significance,
        reverse_fold_change: base.reverse_fold_change || args.reverse_fold_change,
        log2_raw: base.log2_raw,
    };

    Ok((
        DatasetSource {
            raw,
            processed,
            columns,
            transforms,
        },
        extra,
    ))
}
