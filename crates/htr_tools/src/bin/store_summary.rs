use clap::Parser;
use htr_dataset::{summarize_with_thresholds, ValidationOutcome, ValidationThresholds};
use htr_tools::{init_tracing, open_source, StoreArgs};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "store_summary",
    about = "Scan a line-image store and report corrupt, missing and unencodable records"
)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,
    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Skip the alphabet check on labels.
    #[arg(long, default_value_t = false)]
    no_codec: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = args.store.resolve()?;
    let source = open_source(&cfg)?;
    info!(store = %source.store().describe(), count = source.count(), "scanning store");

    let codec = (!args.no_codec).then(|| cfg.codec());
    let thresholds = ValidationThresholds::from_env();
    let report = summarize_with_thresholds(&source, codec.as_ref(), &thresholds)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let s = &report.summary;
        println!(
            "Validation outcome: {} (total={} ok={} corrupt={} missing={} empty_labels={} unencodable={})",
            report.outcome.as_str(),
            s.total,
            s.ok,
            s.corrupt,
            s.missing,
            s.empty_labels,
            s.unencodable
        );
        match (s.min_aspect, s.max_aspect) {
            (Some(lo), Some(hi)) => println!(
                " - aspect ratio {lo:.2}..{hi:.2}, longest label {} chars",
                s.max_label_len
            ),
            _ => println!(" - no readable records"),
        }
        for reason in &report.reasons {
            println!(" - {reason}");
        }
    }
    if report.outcome == ValidationOutcome::Fail {
        anyhow::bail!("Validation failed; see above.");
    }
    Ok(())
}
