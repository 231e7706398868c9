//! Inspect a Netsy chunk or snapshot file: validate every checksum and print
//! each record.
//!
//! ```bash
//! read-netsy-file /path/to/0000000000000000042.netsy
//! ```

use std::fs::File;
use std::io::BufReader;
use std::process;

use netsy_datafile::Reader;

fn main() {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "read-netsy-file".to_string());
    let path = match (args.next(), args.next()) {
        (Some(path), None) => path,
        _ => {
            eprintln!("usage: {program} <filename>");
            process::exit(1);
        }
    };

    if let Err(err) = run(&path) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(path: &str) -> netsy_datafile::Result<()> {
    let file = File::open(path)?;
    let mut reader = Reader::new(BufReader::new(file), None)?;

    for _ in 0..reader.count() {
        let record = reader.read()?;
        println!("{record:?}");
    }

    let summary = reader.finish()?;
    eprintln!(
        "{:?}: {} records, revisions {}..{}",
        summary.kind, summary.records_count, summary.first_revision, summary.last_revision
    );
    Ok(())
}
