// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Local};
use clap::Parser;
use stonemq_partition::{
    decompress_batch, decompress_messages, global_config, setup_local_tracing, setup_tracing,
    AppError, AppResult, BrokerConfig, FieldFilter, Message, MessageContainer, MessageFormat,
    MessageUnmerger, RangeFilter, GLOBAL_CONFIG,
};
use tracing::{info, warn};

/// Prints the messages of a batch file.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// batch file, compact or tree encoded
    #[arg(short, long)]
    file: PathBuf,
    /// the file holds a whole-batch compressed batch
    #[arg(short, long)]
    compressed: bool,
    /// decompress messages before printing them
    #[arg(short, long)]
    decompress: bool,
    /// expand merged messages
    #[arg(short, long)]
    unmerge: bool,
    /// only keep these fields of field group payloads, comma separated
    #[arg(long)]
    fields: Option<String>,
    /// field filter expression, e.g. "kind = x AND region IN eu|us"
    #[arg(long)]
    filter: Option<String>,
    /// bytes of payload shown per message
    #[arg(long, default_value_t = 48)]
    preview: usize,
    /// broker config, supplies the size limit and the log directory
    #[arg(long)]
    config: Option<PathBuf>,
    /// also log into hourly files under the configured log directory
    #[arg(long)]
    log_to_file: bool,
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        let broker_config = BrokerConfig::set_up_config(path)?;
        GLOBAL_CONFIG
            .set(broker_config)
            .map_err(|_| AppError::IllegalStateError("config already loaded".to_string()))?;
    }
    let general = &global_config().general;
    let _guard = if cli.log_to_file {
        Some(setup_tracing(&general.log_dir)?)
    } else {
        setup_local_tracing()?;
        None
    };
    if let Some(path) = &cli.config {
        info!("loaded config from {}", path.display());
    }

    let buffer = Bytes::from(fs::read(&cli.file)?);
    let max_msg_size = general.max_msg_size;
    let mut container = if cli.compressed {
        decompress_batch(&buffer)?
    } else {
        MessageContainer::decode(buffer, true)?
    };
    println!(
        "{}: {:?} batch, {} messages, merged: {}",
        cli.file.display(),
        container.format(),
        container.len(),
        container.has_merged_msg()
    );

    let required_field_names: Vec<String> = cli
        .fields
        .as_deref()
        .map(|fields| {
            fields
                .split(',')
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let field_filter = FieldFilter::new(&required_field_names, cli.filter.as_deref().unwrap_or(""))?;
    if cli.unmerge || field_filter.is_configured() {
        let range_filter = RangeFilter::default();
        container = MessageUnmerger::new(&range_filter, &field_filter).unmerge(container);
    }
    if cli.decompress {
        match decompress_messages(&mut container, true) {
            Ok(ratio) => println!("decompressed, ratio {:.3}", ratio),
            Err(e) => warn!("decompress failed, printing what got decompressed: {}", e),
        }
    }

    let container = container.convert(MessageFormat::Tree);
    for message in container.messages() {
        if message.data.len() > max_msg_size {
            warn!(
                "message {} is {} bytes, above the {} byte limit",
                message.id,
                message.data.len(),
                max_msg_size
            );
        }
        print_message(&message, cli.preview);
    }
    Ok(())
}

fn print_message(message: &Message, preview: usize) {
    let time = DateTime::from_timestamp_micros(message.timestamp)
        .map(|time| {
            time.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string()
        })
        .unwrap_or_else(|| message.timestamp.to_string());
    let shown = &message.data[..message.data.len().min(preview)];
    println!(
        "id={} sub={} time={} payload={} mask={:#04x} compress={} merged={} len={} data={:?}",
        message.id,
        message.offset_in_raw_msg,
        time,
        message.uint16_payload,
        message.uint8_mask,
        message.compress,
        message.merged,
        message.data.len(),
        String::from_utf8_lossy(shown)
    );
}
