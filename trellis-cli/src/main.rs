use clap::{Parser, Subcommand, ValueEnum};
use std::process;
use std::sync::Arc;
use trellis::{
    ColumnSalience, Coordinates, DataFormat, DataQuality, DataSpace, DataStore, Dataset,
    DatasetDefinition, FieldKind, FileTreeStore, ItemContent, MatchCriteria, SinkColumn,
    SourceColumn,
};

/// Trellis CLI: inspect and fill a multi-dimensional data catalog
#[derive(Parser)]
#[command(name = "trellis", version, about)]
struct Cli {
    /// Path to the directory holding dataset trees (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Definition name to load and update
    #[arg(long, default_value = "default")]
    definition: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create a dataset definition over a directory tree
    Define {
        /// Dataset ID (the directory under the data dir)
        dataset_id: String,
        /// Space: "clinical", "samples", or a custom name with --dimension
        #[arg(long, default_value = "clinical")]
        space: String,
        /// Basis dimensions of a custom space, coarsest first
        #[arg(long = "dimension")]
        dimensions: Vec<String>,
        /// Dimensions laid out as directory layers, outermost first
        /// (default: every dimension in order)
        #[arg(long = "layer")]
        layers: Vec<String>,
    },

    /// Declare a source column on the dataset
    AddSource {
        dataset_id: String,
        /// Column name
        column: String,
        /// Row frequency the column varies at
        #[arg(long)]
        frequency: String,
        /// Accepted file extensions (first is canonical)
        #[arg(long = "extension")]
        extensions: Vec<String>,
        /// Required side-car extensions next to the primary file
        #[arg(long = "side-car")]
        side_cars: Vec<String>,
        /// Relative paths required inside a directory entry
        #[arg(long = "contains")]
        contains: Vec<String>,
        /// Declare a field column instead of a file column
        #[arg(long)]
        field: Option<FieldKindArg>,
        /// Salience of the column
        #[arg(long, default_value = "expected")]
        salience: SalienceArg,
        /// Path hint disambiguating multiple matches (glob by default)
        #[arg(long)]
        path: Option<String>,
        /// Treat the path hint as a regular expression
        #[arg(long)]
        regex: bool,
        /// Flag items rated below this quality
        #[arg(long)]
        quality_threshold: Option<QualityArg>,
    },

    /// Declare a sink column on the dataset
    AddSink {
        dataset_id: String,
        /// Column name
        column: String,
        /// Row frequency the column varies at
        #[arg(long)]
        frequency: String,
        /// File extensions of the written item (first is canonical)
        #[arg(long = "extension")]
        extensions: Vec<String>,
        /// Relative paths required inside a directory entry
        #[arg(long = "contains")]
        contains: Vec<String>,
        /// Declare a field sink instead of a file sink
        #[arg(long)]
        field: Option<FieldKindArg>,
        /// Stem (optionally with subdirectories) the item is written under
        #[arg(long)]
        path: Option<String>,
    },

    /// List rows at a frequency
    Rows {
        dataset_id: String,
        #[arg(long)]
        frequency: String,
    },

    /// Resolve a column in one row and describe the item
    Show {
        dataset_id: String,
        column: String,
        /// Row coordinates (e.g. --coord group=control --coord member=01)
        #[arg(long = "coord", value_parser = parse_key_value)]
        coords: Vec<(String, String)>,
    },

    /// Write content into a sink column's item in one row
    Put {
        dataset_id: String,
        column: String,
        /// Row coordinates (e.g. --coord group=control --coord member=01)
        #[arg(long = "coord", value_parser = parse_key_value)]
        coords: Vec<(String, String)>,
        /// Files making up the item (basename becomes the entry name)
        #[arg(long = "file")]
        files: Vec<String>,
        /// JSON value for a field sink
        #[arg(long)]
        value: Option<String>,
    },

    /// Summarize the dataset: space, discovered dimensions, row counts
    Status { dataset_id: String },

    /// Resolve every declared column across its rows and report coverage
    Validate { dataset_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum FieldKindArg {
    Text,
    Number,
    Boolean,
    Array,
}

impl From<FieldKindArg> for FieldKind {
    fn from(kind: FieldKindArg) -> FieldKind {
        match kind {
            FieldKindArg::Text => FieldKind::Text,
            FieldKindArg::Number => FieldKind::Number,
            FieldKindArg::Boolean => FieldKind::Boolean,
            FieldKindArg::Array => FieldKind::Array,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SalienceArg {
    Checked,
    Optional,
    Expected,
    Required,
}

impl From<SalienceArg> for ColumnSalience {
    fn from(salience: SalienceArg) -> ColumnSalience {
        match salience {
            SalienceArg::Checked => ColumnSalience::Checked,
            SalienceArg::Optional => ColumnSalience::Optional,
            SalienceArg::Expected => ColumnSalience::Expected,
            SalienceArg::Required => ColumnSalience::Required,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityArg {
    Unusable,
    Artefactual,
    Questionable,
    Noisy,
    Usable,
}

impl From<QualityArg> for DataQuality {
    fn from(quality: QualityArg) -> DataQuality {
        match quality {
            QualityArg::Unusable => DataQuality::Unusable,
            QualityArg::Artefactual => DataQuality::Artefactual,
            QualityArg::Questionable => DataQuality::Questionable,
            QualityArg::Noisy => DataQuality::Noisy,
            QualityArg::Usable => DataQuality::Usable,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Command::Define {
            ref dataset_id,
            ref space,
            ref dimensions,
            ref layers,
        } => {
            let space = build_space(space, dimensions)?;
            let layers = if layers.is_empty() {
                space.dimensions().to_vec()
            } else {
                layers.clone()
            };
            let store = FileTreeStore::new(&cli.data_dir, layers.clone())?;
            store.create_dataset(dataset_id)?;
            let dataset = Dataset::open(Arc::new(store), dataset_id, space);
            dataset.save(&cli.definition, &layers)?;
            print_output(
                &serde_json::json!({ "ok": true, "dataset": dataset_id, "definition": cli.definition }),
                &cli.format,
            );
        }

        Command::AddSource {
            ref dataset_id,
            ref column,
            ref frequency,
            ref extensions,
            ref side_cars,
            ref contains,
            field,
            salience,
            ref path,
            regex,
            ref quality_threshold,
        } => {
            let (mut dataset, definition) = open_dataset(&cli, dataset_id)?;
            let format = build_format(extensions, side_cars, contains, field)?;
            let frequency = dataset.space().frequency(frequency)?;
            let mut source =
                SourceColumn::new(column, format, frequency).salience(salience.into());
            if let Some(pattern) = path {
                source = source.criteria(if regex {
                    MatchCriteria::regex(pattern)
                } else {
                    MatchCriteria::path(pattern)
                });
            }
            if let Some(threshold) = quality_threshold {
                source = source.quality_threshold((*threshold).into());
            }
            dataset.add_source(source)?;
            dataset.save(&cli.definition, &definition.hierarchy)?;
            print_output(
                &serde_json::json!({ "ok": true, "source": column }),
                &cli.format,
            );
        }

        Command::AddSink {
            ref dataset_id,
            ref column,
            ref frequency,
            ref extensions,
            ref contains,
            field,
            ref path,
        } => {
            let (mut dataset, definition) = open_dataset(&cli, dataset_id)?;
            let format = build_format(extensions, &[], contains, field)?;
            let frequency = dataset.space().frequency(frequency)?;
            let mut sink = SinkColumn::new(column, format, frequency);
            if let Some(path) = path {
                sink = sink.path(path);
            }
            dataset.add_sink(sink)?;
            dataset.save(&cli.definition, &definition.hierarchy)?;
            print_output(
                &serde_json::json!({ "ok": true, "sink": column }),
                &cli.format,
            );
        }

        Command::Rows {
            ref dataset_id,
            ref frequency,
        } => {
            let (dataset, _) = open_dataset(&cli, dataset_id)?;
            let frequency = dataset.space().frequency(frequency)?;
            let rows: Vec<Coordinates> = dataset
                .rows(frequency)?
                .iter()
                .map(|row| row.coordinates().clone())
                .collect();
            print_output(
                &serde_json::json!({
                    "frequency": dataset.space().frequency_name(frequency),
                    "count": rows.len(),
                    "rows": rows,
                }),
                &cli.format,
            );
        }

        Command::Show {
            ref dataset_id,
            ref column,
            ref coords,
        } => {
            let (dataset, _) = open_dataset(&cli, dataset_id)?;
            let (frequency, coordinates) = locate(&dataset, column, coords)?;
            let row = dataset.row(frequency, coordinates)?;
            let item = row.item(column)?;

            let mut output = serde_json::json!({
                "column": column,
                "coordinates": row.coordinates(),
                "absent": item.is_absent(),
                "quality": item.quality(),
                "excluded_by_quality": item.excluded_by_quality(),
                "entries": item.entries().iter().map(|e| {
                    serde_json::json!({ "name": e.name, "size": e.size })
                }).collect::<Vec<_>>(),
            });
            if item.format().is_field() && !item.is_absent() {
                output["value"] = item.get()?.as_value().cloned().unwrap_or_default();
            }
            if let Some(record) = item.read_provenance()? {
                output["provenance"] = serde_json::to_value(&record)?;
            }
            print_output(&output, &cli.format);
        }

        Command::Put {
            ref dataset_id,
            ref column,
            ref coords,
            ref files,
            ref value,
        } => {
            let (dataset, _) = open_dataset(&cli, dataset_id)?;
            let (frequency, coordinates) = locate(&dataset, column, coords)?;
            let row = dataset.row(frequency, coordinates)?;
            let item = row.item(column)?;

            let content = build_content(files, value)?;
            item.put(content)?;
            print_output(
                &serde_json::json!({
                    "ok": true,
                    "column": column,
                    "entries": item.entries().iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
                }),
                &cli.format,
            );
        }

        Command::Status { ref dataset_id } => {
            let (dataset, definition) = open_dataset(&cli, dataset_id)?;
            let space = dataset.space();

            let mut dimensions = serde_json::Map::new();
            for dimension in space.dimensions() {
                let values = dataset.store().list_coordinates(dataset_id, dimension)?;
                dimensions.insert(dimension.clone(), serde_json::json!(values.len()));
            }
            let mut row_counts = serde_json::Map::new();
            let mut names: Vec<String> = vec!["dataset".to_string()];
            names.extend(space.aliases().keys().cloned());
            let span_name = space.frequency_name(space.span());
            if !names.contains(&span_name) {
                names.push(span_name);
            }
            for name in names {
                let frequency = space.frequency(&name)?;
                row_counts.insert(name, serde_json::json!(dataset.rows(frequency)?.len()));
            }

            print_output(
                &serde_json::json!({
                    "dataset": dataset_id,
                    "space": space.name(),
                    "hierarchy": definition.hierarchy,
                    "dimensions": dimensions,
                    "rows": row_counts,
                    "sources": dataset.sources().map(|c| c.name.clone()).collect::<Vec<_>>(),
                    "sinks": dataset.sinks().map(|c| c.name.clone()).collect::<Vec<_>>(),
                }),
                &cli.format,
            );
        }

        Command::Validate { ref dataset_id } => {
            let (dataset, _) = open_dataset(&cli, dataset_id)?;
            let mut columns = Vec::new();
            let mut clean = true;

            let sources: Vec<SourceColumn> = dataset.sources().cloned().collect();
            for column in sources {
                let rows = dataset.rows(column.frequency)?;
                let mut found = 0usize;
                let mut absent = 0usize;
                let mut flagged = 0usize;
                let mut errors = Vec::new();
                for row in &rows {
                    match row.item(&column.name) {
                        Ok(item) if item.is_absent() => absent += 1,
                        Ok(item) => {
                            found += 1;
                            if item.excluded_by_quality() {
                                flagged += 1;
                            }
                        }
                        Err(err) => {
                            clean = false;
                            errors.push(format!("[{}]: {err}", row.coordinates()));
                        }
                    }
                }
                columns.push(serde_json::json!({
                    "column": column.name,
                    "kind": "source",
                    "frequency": dataset.space().frequency_name(column.frequency),
                    "salience": column.salience,
                    "rows": rows.len(),
                    "found": found,
                    "absent": absent,
                    "below_quality_threshold": flagged,
                    "errors": errors,
                }));
            }

            let sinks: Vec<SinkColumn> = dataset.sinks().cloned().collect();
            for column in sinks {
                let rows = dataset.rows(column.frequency)?;
                let mut derived = 0usize;
                let mut errors = Vec::new();
                for row in &rows {
                    match row.item(&column.name) {
                        Ok(item) if !item.is_absent() => derived += 1,
                        Ok(_) => {}
                        Err(err) => {
                            clean = false;
                            errors.push(format!("[{}]: {err}", row.coordinates()));
                        }
                    }
                }
                columns.push(serde_json::json!({
                    "column": column.name,
                    "kind": "sink",
                    "frequency": dataset.space().frequency_name(column.frequency),
                    "rows": rows.len(),
                    "derived": derived,
                    "errors": errors,
                }));
            }

            print_output(
                &serde_json::json!({ "dataset": dataset_id, "ok": clean, "columns": columns }),
                &cli.format,
            );
        }
    }

    Ok(())
}

/// Load the saved definition, then reopen the store with the hierarchy
/// it declares.
fn open_dataset(cli: &Cli, dataset_id: &str) -> CliResult<(Dataset, DatasetDefinition)> {
    let probe = FileTreeStore::new(&cli.data_dir, Vec::<String>::new())?;
    let yaml = probe
        .load_definition(dataset_id, &cli.definition)?
        .ok_or_else(|| {
            format!(
                "dataset {dataset_id} has no definition named {}; run `trellis define` first",
                cli.definition
            )
        })?;
    let definition = DatasetDefinition::from_yaml(&yaml)?;
    let store = FileTreeStore::new(&cli.data_dir, definition.hierarchy.clone())?;
    let dataset = definition.instantiate(Arc::new(store), dataset_id)?;
    Ok((dataset, definition))
}

fn build_space(name: &str, dimensions: &[String]) -> CliResult<DataSpace> {
    if !dimensions.is_empty() {
        return Ok(DataSpace::new(name, dimensions.iter().cloned())?);
    }
    match name {
        "clinical" => Ok(DataSpace::clinical()),
        "samples" => Ok(DataSpace::samples()),
        other => Err(format!(
            "unknown space '{other}'; use clinical, samples, or pass --dimension"
        )
        .into()),
    }
}

fn build_format(
    extensions: &[String],
    side_cars: &[String],
    contains: &[String],
    field: Option<FieldKindArg>,
) -> CliResult<DataFormat> {
    if let Some(kind) = field {
        return Ok(DataFormat::field(kind.into()));
    }
    if !contains.is_empty() {
        let refs: Vec<&str> = contains.iter().map(String::as_str).collect();
        return Ok(DataFormat::directory(&refs));
    }
    if !side_cars.is_empty() {
        let primary = extensions
            .first()
            .ok_or("side-car formats need a primary --extension")?;
        let refs: Vec<&str> = side_cars.iter().map(String::as_str).collect();
        return Ok(DataFormat::with_side_cars(primary, &refs, &[]));
    }
    if extensions.is_empty() {
        return Err("pass --extension, --side-car, --contains or --field".into());
    }
    let refs: Vec<&str> = extensions.iter().map(String::as_str).collect();
    Ok(DataFormat::file(&refs))
}

/// The row a column command addresses: the column's own frequency with
/// the provided coordinates.
fn locate(
    dataset: &Dataset,
    column: &str,
    coords: &[(String, String)],
) -> CliResult<(trellis::Frequency, Coordinates)> {
    let frequency = if let Some(source) = dataset.source(column) {
        source.frequency
    } else if let Some(sink) = dataset.sink(column) {
        sink.frequency
    } else {
        return Err(format!("no column named {column}").into());
    };
    let coordinates =
        Coordinates::from_pairs(coords.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok((frequency, coordinates))
}

fn build_content(files: &[String], value: &Option<String>) -> CliResult<ItemContent> {
    if let Some(raw) = value {
        let parsed = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        return Ok(ItemContent::value(parsed));
    }
    if files.is_empty() {
        return Err("pass --file or --value".into());
    }
    let mut blobs = std::collections::BTreeMap::new();
    for path in files {
        let name = std::path::Path::new(path)
            .file_name()
            .ok_or_else(|| format!("not a file path: {path}"))?
            .to_string_lossy()
            .into_owned();
        blobs.insert(name, std::fs::read(path)?);
    }
    Ok(ItemContent::Files(blobs))
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value).unwrap());
        }
    }
}
