//! Convert a binary capture to JSONL (one JSON object per line).
//!
//! Usage:
//!   cargo run --example trace_to_jsonl -- <input.bin> [output.jsonl]
//!
//! If output is omitted, writes to stdout.

use framescope::capture::TraceReader;
use framescope::capture::format::MAGIC;
use std::io::{BufWriter, Write};

fn main() -> std::io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: trace_to_jsonl <input.bin> [output.jsonl]");
        std::process::exit(1);
    }

    let mut reader = TraceReader::open(&args[1])?;
    let (magic, version) = reader.read_header()?;
    if magic.as_bytes() != MAGIC {
        eprintln!("not a framescope capture (got: {magic})");
        std::process::exit(1);
    }
    eprintln!("{magic} v{version}, converting...");

    let out: Box<dyn Write> = if let Some(path) = args.get(2) {
        Box::new(std::fs::File::create(path)?)
    } else {
        Box::new(std::io::stdout().lock())
    };
    let mut w = BufWriter::new(out);

    let mut count = 0u64;
    while let Some(message) = reader.read_raw_message()? {
        serde_json::to_writer(&mut w, &message).map_err(std::io::Error::other)?;
        w.write_all(b"\n")?;
        count += 1;
    }
    w.flush()?;
    eprintln!("{count} messages written");
    Ok(())
}
