use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{
    config::{ReaderConfig, ShareModeSetting},
    history::ApduHistory,
    monitor::{ReaderEvent, ReaderMonitor},
    reader::{PcscContext, PcscTransport},
    transport::Transport,
    utils::{format_ascii, format_block_dump, format_hex, format_hex_spaced, parse_hex},
};

#[derive(Parser)]
#[command(name = "pcsc-nfc")]
#[command(about = "Read and write NFC memory tags through PCSC readers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Reader configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Bytes per tag memory block
    #[arg(long, global = true)]
    pub block_size: Option<usize>,

    /// Largest payload fetched by a single read command
    #[arg(long, global = true)]
    pub packet_size: Option<usize>,

    /// Connection share mode (shared or exclusive)
    #[arg(short, long, global = true)]
    pub mode: Option<ShareModeSetting>,

    /// Deadline for a single card command, in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Print the exchanged APDUs when the command completes
    #[arg(long, global = true)]
    pub history: bool,

    /// Export the exchanged APDUs to a JSON file
    #[arg(long, global = true)]
    pub export_history: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Watch all readers and report card insertion and removal
    Watch,

    /// Read the UID of the tag on a reader
    Uid {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,
    },

    /// Read tag memory
    Read {
        /// Reader name or index
        reader: String,

        /// First block to read
        block: usize,

        /// Number of bytes to read
        length: usize,

        /// Decode the memory as UTF-8 text
        #[arg(short, long)]
        text: bool,

        /// Show data in different formats
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Write whole blocks of tag memory
    Write {
        /// Reader name or index
        reader: String,

        /// First block to write
        block: usize,

        /// Data in hex format, or text with --text
        data: String,

        /// Write DATA as UTF-8 text, zero-padded to whole blocks
        #[arg(short, long)]
        text: bool,
    },
}

#[derive(Clone, Debug)]
pub enum ResponseFormat {
    Hex,
    HexSpaced,
    BlockDump,
    Ascii,
    All,
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(ResponseFormat::Hex),
            "spaced" => Ok(ResponseFormat::HexSpaced),
            "dump" => Ok(ResponseFormat::BlockDump),
            "ascii" => Ok(ResponseFormat::Ascii),
            "all" => Ok(ResponseFormat::All),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

type SharedHistory = Arc<Mutex<ApduHistory>>;

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = load_config(&cli)?;
    let history = history_sink(cli.history, cli.export_history.is_some());
    let recorder = history.as_ref();

    let result = match &cli.command {
        Commands::List { detailed } => cmd_list(*detailed, cli.json),
        Commands::Watch => cmd_watch(&config, recorder, cli.json).await,
        Commands::Uid { reader } => cmd_uid(reader, &config, recorder, cli.json).await,
        Commands::Read {
            reader,
            block,
            length,
            text,
            format,
        } => {
            cmd_read(
                reader,
                *block,
                *length,
                *text,
                format.clone(),
                &config,
                recorder,
            )
            .await
        }
        Commands::Write {
            reader,
            block,
            data,
            text,
        } => cmd_write(reader, *block, data, *text, &config, recorder).await,
    };

    if let Some(history) = &history {
        if cli.history {
            print_history(history);
        }
        if let Some(path) = &cli.export_history {
            export_history(history, path)?;
        }
    }

    result
}

fn load_config(cli: &Cli) -> Result<ReaderConfig> {
    let mut config = match &cli.config {
        Some(path) => ReaderConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => ReaderConfig::default(),
    };

    if let Some(block_size) = cli.block_size {
        config.block_size = block_size;
    }
    if let Some(packet_size) = cli.packet_size {
        config.packet_size = packet_size;
    }
    if let Some(mode) = cli.mode {
        config.share_mode = mode;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.transmit_timeout_ms = Some(timeout_ms);
    }

    config.validate().context("Invalid reader configuration")?;
    Ok(config)
}

fn cmd_list(detailed: bool, json: bool) -> Result<()> {
    let context = PcscContext::establish().context("Failed to initialize PCSC")?;
    let readers = context.list_readers().context("Failed to list readers")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&readers)?);
        return Ok(());
    }

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.card_present {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
            if let Some(standard) = reader_info.standard {
                println!("      Standard: {standard}");
            }
        } else if let (Some(atr), Some(standard)) = (&reader_info.atr, reader_info.standard) {
            println!(
                "  [{}] {} [CARD {} - ATR: {}]",
                i,
                reader_info.name,
                standard,
                format_hex_spaced(atr)
            );
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

struct WatchedReader {
    monitor: Arc<ReaderMonitor<PcscTransport>>,
    task: JoinHandle<()>,
}

async fn cmd_watch(
    config: &ReaderConfig,
    history: Option<&SharedHistory>,
    json: bool,
) -> Result<()> {
    let context = PcscContext::establish().context("Failed to initialize PCSC")?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut readers: HashMap<String, WatchedReader> = HashMap::new();

    let mut rescan = tokio::time::interval(Duration::from_secs(1));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if !json {
        println!("Watching PCSC readers, press Ctrl-C to stop");
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = rescan.tick() => {
                sync_readers(&context, &mut readers, config, &events_tx, history);
            }
            Some(event) = events_rx.recv() => {
                print_event(&event, json)?;

                if let ReaderEvent::CardInserted { reader, card } = &event {
                    if !card.standard.is_memory_tag() {
                        continue;
                    }
                    if let Some(watched) = readers.get(reader) {
                        report_uid(Arc::clone(&watched.monitor), json);
                    }
                }
            }
        }
    }

    for (_, watched) in readers {
        watched.task.abort();
    }
    Ok(())
}

fn sync_readers(
    context: &PcscContext,
    readers: &mut HashMap<String, WatchedReader>,
    config: &ReaderConfig,
    events: &mpsc::UnboundedSender<ReaderEvent>,
    history: Option<&SharedHistory>,
) {
    let names = match context.reader_names() {
        Ok(names) => names,
        Err(e) => {
            log::warn!("Failed to list readers: {e}");
            return;
        }
    };

    readers.retain(|name, watched| {
        let keep = names.contains(name) && !watched.task.is_finished();
        if !keep {
            watched.task.abort();
            let _ = events.send(ReaderEvent::ReaderDetached {
                reader: name.clone(),
            });
        }
        keep
    });

    for name in names {
        if readers.contains_key(&name) {
            continue;
        }
        match watch_reader(context, &name, config, events, history) {
            Ok(watched) => {
                let _ = events.send(ReaderEvent::ReaderAttached {
                    reader: name.clone(),
                });
                readers.insert(name, watched);
            }
            Err(e) => log::error!("Failed to watch reader {name}: {e:#}"),
        }
    }
}

fn watch_reader(
    context: &PcscContext,
    name: &str,
    config: &ReaderConfig,
    events: &mpsc::UnboundedSender<ReaderEvent>,
    history: Option<&SharedHistory>,
) -> Result<WatchedReader> {
    let transport = context.transport(name)?;
    let status = context
        .watch_status(name, config.poll_timeout())
        .with_context(|| format!("Failed to watch reader status: {name}"))?;

    let monitor = Arc::new(recorded(
        ReaderMonitor::new(name, transport, config.clone(), events.clone()),
        history,
    ));
    let task = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        async move { monitor.run(status).await }
    });

    Ok(WatchedReader { monitor, task })
}

/// Read and print the UID of a freshly inserted tag without stalling the
/// event loop on card I/O.
fn report_uid<T>(monitor: Arc<ReaderMonitor<T>>, json: bool) -> JoinHandle<()>
where
    T: Transport + 'static,
{
    tokio::spawn(async move {
        let reader = monitor.name();
        match monitor.uid().await {
            Ok(uid) if json => match serde_json::to_string(&uid) {
                Ok(line) => println!("{line}"),
                Err(e) => log::warn!("{reader}: failed to encode UID: {e}"),
            },
            Ok(uid) => println!("[{reader}] UID: {} (reversed {})", uid.hex, uid.reverse_hex),
            Err(e) => log::warn!("{reader}: failed to read UID: {e}"),
        }
    })
}

fn print_event(event: &ReaderEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{event}");
    }
    Ok(())
}

async fn cmd_uid(
    reader_name: &str,
    config: &ReaderConfig,
    history: Option<&SharedHistory>,
    json: bool,
) -> Result<()> {
    let monitor = open_reader(reader_name, config, history).await?;
    let uid = monitor.uid().await.context("Failed to read card UID")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&uid)?);
    } else {
        println!("UID: {}", uid.hex);
        println!("UID (reversed): {}", uid.reverse_hex);
    }
    Ok(())
}

async fn cmd_read(
    reader_name: &str,
    block: usize,
    length: usize,
    text: bool,
    format: Option<ResponseFormat>,
    config: &ReaderConfig,
    history: Option<&SharedHistory>,
) -> Result<()> {
    let monitor = open_reader(reader_name, config, history).await?;

    if text {
        let text = monitor
            .read_text(block, length)
            .await
            .context("Failed to read tag memory")?;
        println!("{text}");
        return Ok(());
    }

    let data = monitor
        .read_bytes(block, length)
        .await
        .context("Failed to read tag memory")?;
    let format = format.unwrap_or(ResponseFormat::BlockDump);
    print_data(&data, block, config.block_size, &format);
    Ok(())
}

async fn cmd_write(
    reader_name: &str,
    block: usize,
    data: &str,
    text: bool,
    config: &ReaderConfig,
    history: Option<&SharedHistory>,
) -> Result<()> {
    // Parse before touching the reader so bad input fails fast
    let bytes = if text {
        None
    } else {
        Some(parse_hex(data).context("Failed to parse data hex string")?)
    };

    let monitor = open_reader(reader_name, config, history).await?;
    let written = match &bytes {
        Some(bytes) => {
            monitor.write_bytes(block, bytes).await?;
            bytes.len()
        }
        None => monitor.write_text(block, data).await?,
    };

    println!("Wrote {written} bytes starting at block {block}");
    Ok(())
}

/// Connect to the card currently on `name_or_index`.
async fn open_reader(
    name_or_index: &str,
    config: &ReaderConfig,
    history: Option<&SharedHistory>,
) -> Result<ReaderMonitor<PcscTransport>> {
    let context = PcscContext::establish().context("Failed to initialize PCSC")?;
    let reader_name = resolve_reader_name(&context, name_or_index)?;

    let status = context
        .reader_status(&reader_name)
        .with_context(|| format!("Failed to query reader: {reader_name}"))?;
    if !status.card_present {
        bail!("No card present on reader: {reader_name}");
    }

    // one-shot commands do not listen to presence events
    let (events, _) = mpsc::unbounded_channel();
    let monitor = recorded(
        ReaderMonitor::new(
            reader_name.clone(),
            context.transport(&reader_name)?,
            config.clone(),
            events,
        ),
        history,
    );

    monitor
        .handle_status(&status.status_change())
        .await
        .with_context(|| format!("Failed to connect to card on reader: {reader_name}"))?;
    Ok(monitor)
}

fn resolve_reader_name(context: &PcscContext, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = context.reader_names().context("Failed to list readers")?;
        if readers.is_empty() {
            bail!("No PCSC readers found");
        }
        return readers.get(index).cloned().with_context(|| {
            format!(
                "Reader index {} out of range (0-{})",
                index,
                readers.len() - 1
            )
        });
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_data(data: &[u8], block: usize, block_size: usize, format: &ResponseFormat) {
    if data.is_empty() {
        println!("Data: (empty)");
        return;
    }

    match format {
        ResponseFormat::Hex => println!("Data: {}", format_hex(data)),
        ResponseFormat::HexSpaced => println!("Data: {}", format_hex_spaced(data)),
        ResponseFormat::BlockDump => println!("{}", format_block_dump(block, data, block_size)),
        ResponseFormat::Ascii => println!("Data (ASCII): {}", format_ascii(data)),
        ResponseFormat::All => {
            println!("Data (Hex): {}", format_hex_spaced(data));
            println!("Data (ASCII): {}", format_ascii(data));
            println!("{}", format_block_dump(block, data, block_size));
        }
    }
}

/// History is only kept when it will be printed or exported.
fn history_sink(print: bool, export: bool) -> Option<SharedHistory> {
    (print || export).then(|| Arc::new(Mutex::new(ApduHistory::new())))
}

fn recorded<T: Transport>(
    monitor: ReaderMonitor<T>,
    history: Option<&SharedHistory>,
) -> ReaderMonitor<T> {
    match history {
        Some(history) => monitor.with_history(Arc::clone(history)),
        None => monitor,
    }
}

fn print_history(history: &SharedHistory) {
    let history = history.lock().unwrap_or_else(PoisonError::into_inner);
    if history.records().is_empty() {
        println!("No commands in history");
        return;
    }

    println!("APDU history:");
    for (i, record) in history.records().iter().enumerate() {
        let status = if record.success { "OK" } else { "ERROR" };
        println!(
            "  [{}] {} {} - {} ({}ms)",
            i + 1,
            record.timestamp.format("%H:%M:%S"),
            record.kind.label(),
            status,
            record.duration_ms
        );
        println!("      > {}", format_hex_spaced(&record.command));
        if let Some(error) = &record.error {
            println!("      ! {error}");
        } else {
            println!("      < {}", format_hex_spaced(&record.response));
        }
    }

    let stats = history.statistics();
    println!(
        "Total: {} ({} ok, {} failed), average {}ms",
        stats.total_commands,
        stats.successful_commands,
        stats.failed_commands,
        stats.average_duration_ms
    );
}

fn export_history(history: &SharedHistory, path: &Path) -> Result<()> {
    let json = history
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .export_json()?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write history file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Result as CardResult;
    use crate::core::transport::StatusChange;
    use pcsc::{Disposition, Protocol, ShareMode};

    /// Card that never answers a command
    struct SilentTransport;

    impl Transport for SilentTransport {
        async fn connect(&self, _share_mode: ShareMode) -> CardResult<Protocol> {
            Ok(Protocol::T1)
        }

        async fn disconnect(&self, _disposition: Disposition) -> CardResult<()> {
            Ok(())
        }

        async fn transmit(
            &self,
            _command: &[u8],
            _max_response_len: usize,
            _protocol: Protocol,
        ) -> CardResult<Vec<u8>> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_history_kept_only_when_requested() {
        assert!(history_sink(false, false).is_none());
        assert!(history_sink(true, false).is_some());
        assert!(history_sink(false, true).is_some());
    }

    #[tokio::test]
    async fn test_uid_report_does_not_block_caller() {
        let (events, _rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(ReaderMonitor::new(
            "Silent Reader",
            SilentTransport,
            ReaderConfig::default(),
            events,
        ));
        monitor
            .handle_status(&StatusChange::present(&[0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F]))
            .await
            .unwrap();

        let report = report_uid(Arc::clone(&monitor), false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!report.is_finished());

        report.abort();
        assert!(report.await.unwrap_err().is_cancelled());
        // the aborted lookup released the session
        assert!(monitor.is_card_present().await);
    }
}
