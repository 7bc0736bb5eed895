//! List recorded dumps

use clap::Args;
use gridtext::{Justify, Table};

use barrow::{Store, human_size};

use super::{CommandResult, Paths};

/// List recorded dumps
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Configuration name
    config: String,

    /// Only show this disk
    disk: Option<String>,
}

pub fn run(paths: &Paths, args: HistoryArgs) -> CommandResult {
    let config = paths.load(&args.config)?;
    if let Some(disk) = &args.disk
        && config.disk(disk).is_none()
    {
        return Err(format!("unknown disk {disk:?}").into());
    }
    if !config.layout.db_file.exists() {
        eprintln!("No dump recorded yet for {:?}", config.name);
        return Ok(());
    }

    let store = Store::open(&config.layout.db_file)?;
    let history = store.history(args.disk.as_deref())?;
    if history.is_empty() {
        eprintln!("No dump recorded yet for {:?}", config.name);
        return Ok(());
    }

    let mut table = Table::new()
        .caption(format!("{} DUMPS", config.name.to_uppercase()))
        .column("RUN", Justify::Right)
        .column("DATE", Justify::Left)
        .column("DISK", Justify::Left)
        .column("BASE", Justify::Right)
        .column("STATE", Justify::Center)
        .column("SIZE", Justify::Right)
        .column("FILE", Justify::Left);
    for (dump, run) in &history {
        table.row([
            format!("{:04}", dump.runid),
            run.hrs.to_date(),
            dump.disk.clone(),
            format!("{:03}", dump.baseline),
            dump.state.to_string(),
            dump.comp_bytes.map(human_size).unwrap_or_else(|| "-".into()),
            dump.filename.clone(),
        ]);
    }

    for line in table.render() {
        println!("{line}");
    }
    eprintln!("{} dump(s)", history.len());
    Ok(())
}
