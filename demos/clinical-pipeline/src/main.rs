use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use trellis::{
    ColumnSalience, DataFormat, DataSpace, Dataset, FileTreeStore, ItemContent, Pipeline,
    SinkColumn, SourceColumn,
};

/// Seeds a small clinical study tree, catalogs it, and derives a summary
/// per session. Run it twice: the second run finds every row up to date.
fn main() -> trellis::Result<()> {
    env_logger::init();

    let data_dir = std::env::var("TRELLIS_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    log::info!("Using data directory: {data_dir}");
    seed_study(&data_dir)?;

    let space = DataSpace::clinical();
    let session = space.frequency("session")?;
    let hierarchy = ["group".to_string(), "member".to_string(), "timepoint".to_string()];

    let store = FileTreeStore::new(&data_dir, hierarchy.clone())?;
    let mut dataset = Dataset::open(Arc::new(store), "demo-study", space);
    dataset.add_source(
        SourceColumn::new("readings", DataFormat::file(&["csv"]), session)
            .salience(ColumnSalience::Required),
    )?;
    dataset.add_sink(SinkColumn::new(
        "summary",
        DataFormat::file(&["json"]),
        session,
    ))?;
    dataset.save("default", &hierarchy)?;

    let pipeline = Pipeline::new("summarize", session)
        .source("readings")
        .sink("summary")
        .parameter_with_default(
            "scale",
            trellis::ParameterSalience::Optional,
            serde_json::json!(1.0),
        );

    let parameters = BTreeMap::new();
    let report = pipeline.run(&dataset, &parameters, |context| {
        let content = context.inputs["readings"].get()?;
        let text = String::from_utf8_lossy(content.bytes().unwrap_or_default()).into_owned();
        let scale = context.parameters["scale"].as_f64().unwrap_or(1.0);

        let values: Vec<f64> = text
            .lines()
            .skip(1)
            .filter_map(|line| line.split(',').nth(1))
            .filter_map(|v| v.parse::<f64>().ok())
            .map(|v| v * scale)
            .collect();
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;

        let summary = serde_json::json!({
            "count": values.len(),
            "mean": mean,
        });
        Ok(BTreeMap::from([(
            "summary".to_string(),
            ItemContent::single_file("summary.json", summary.to_string().as_bytes()),
        )]))
    })?;

    println!("{}", serde_yaml::to_string(&report).unwrap_or_default());
    log::info!(
        "processed {} rows, {} already up to date",
        report.processed,
        report.skipped_up_to_date
    );
    Ok(())
}

/// Three sessions with raw heart-rate readings, laid out the way a study
/// tree arrives from a scanner export.
fn seed_study(data_dir: &str) -> trellis::Result<()> {
    for (group, member, bpm) in [("control", "01", 62), ("control", "02", 71), ("test", "01", 84)] {
        let session_dir = format!("{data_dir}/demo-study/{group}/{member}/baseline");
        fs::create_dir_all(&session_dir)?;
        let readings = format!("t,bpm\n0,{bpm}\n1,{}\n2,{}\n", bpm + 2, bpm - 1);
        fs::write(format!("{session_dir}/readings.csv"), readings)?;
    }
    Ok(())
}
