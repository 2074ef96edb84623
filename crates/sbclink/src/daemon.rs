//! Daemon lifecycle: build the link, connect, serve IPC, shut down.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, OnceLock};

use tracing::{error, info, warn};

use sbclink_link::{
    EventSink, LinkHandle, Outcome, Processor, ProcessorConfig,
};
use sbclink_packet::{parse, CodeChannel, PauseReason, ReplyFlags, Request};
use sbclink_spi::{ReadyLine, SpiBus, SpiLink, SpidevBus, SysfsReadyLine};
use sbclink_transfer::{DataTransfer, TransferConfig, SimulatedPeer};

use crate::cmd::RunArgs;
use crate::config::Config;
use crate::exit::{DaemonError, DaemonResult, SUCCESS};
use crate::ipc::IpcServer;
use crate::macros::{self, MacroRequest};
use crate::model::ObjectModelMirror;

/// Routes firmware events to the daemon's collaborators: the object-model
/// mirror, the macro feeder, the file service and the log.
struct DaemonSink {
    model: Arc<ObjectModelMirror>,
    macro_requests: Sender<MacroRequest>,
    files_dir: PathBuf,
    /// Filled right after the Processor is constructed.
    handle: Arc<OnceLock<LinkHandle>>,
}

impl DaemonSink {
    fn handle(&self) -> Option<&LinkHandle> {
        self.handle.get()
    }
}

impl EventSink for DaemonSink {
    fn object_model(&self, data: &str) {
        self.model.apply_patch(data);
    }

    fn message(&self, flags: ReplyFlags, content: &str) {
        if flags.is_error() {
            error!(target: crate::logging::FIRMWARE_TARGET, "{content}");
        } else if flags.is_warning() {
            warn!(target: crate::logging::FIRMWARE_TARGET, "{content}");
        } else {
            info!(target: crate::logging::FIRMWARE_TARGET, "{content}");
        }
    }

    fn macro_requested(
        &self,
        channel: CodeChannel,
        filename: &str,
        report_missing: bool,
        _from_code: bool,
    ) {
        let request = MacroRequest {
            channel,
            filename: filename.to_owned(),
            report_missing,
        };
        if self.macro_requests.send(request).is_err() {
            warn!(filename, "macro feeder is gone; completing the frame as failed");
            if let Some(handle) = self.handle() {
                handle.macro_finished(channel, false);
            }
        }
    }

    fn print_paused(&self, file_position: u32, reason: PauseReason) {
        info!(file_position, ?reason, "print paused by firmware");
    }

    fn file_chunk_requested(&self, filename: &str, offset: u32, max_length: u32) {
        let Some(handle) = self.handle() else { return };
        handle.send_request(read_file_chunk(&self.files_dir, filename, offset, max_length));
    }

    fn evaluation_result(&self, channel: CodeChannel, error: bool, value: &str) {
        info!(channel = %channel, error, value, "expression evaluated");
    }

    fn do_code(&self, channel: CodeChannel, code: &str) {
        let Some(handle) = self.handle() else { return };
        let parsed = match parse(code, channel) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(code, %err, "firmware sent an unparsable code");
                handle.send_request(Request::Reply {
                    channel: channel as u8,
                    error: true,
                    content: err.to_string(),
                });
                return;
            }
        };

        // The reply is sent back once the code completes; wait off-task.
        let waiter = handle.push_code(parsed);
        let handle = handle.clone();
        let spawned = std::thread::Builder::new()
            .name("do-code".into())
            .spawn(move || {
                let (error, content) = match waiter.wait() {
                    Outcome::Completed(result) => (!result.success, result.reply),
                    Outcome::Aborted => (true, "aborted".to_owned()),
                    Outcome::Cancelled => (true, "cancelled".to_owned()),
                };
                handle.send_request(Request::Reply {
                    channel: channel as u8,
                    error,
                    content,
                });
            });
        if let Err(err) = spawned {
            warn!(%err, "cannot spawn do-code thread");
        }
    }

    fn firmware_reset(&self) {
        warn!("firmware reset; all channels invalidated");
    }
}

/// Serve a firmware `FileChunkRequest`; a negative length reports failure.
fn read_file_chunk(files_dir: &Path, filename: &str, offset: u32, max_length: u32) -> Request {
    let failure = Request::FileChunk {
        data_length: -1,
        file_length: 0,
        data: Vec::new(),
    };

    let Some(path) = macros::resolve(files_dir, filename) else {
        warn!(filename, "refusing file chunk outside the files directory");
        return failure;
    };
    let mut file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), %err, "file chunk request failed");
            return failure;
        }
    };
    let file_length = match file.metadata() {
        Ok(metadata) => metadata.len() as u32,
        Err(_) => return failure,
    };
    if file.seek(SeekFrom::Start(offset as u64)).is_err() {
        return failure;
    }

    let mut data = vec![0u8; max_length as usize];
    let mut read = 0usize;
    loop {
        match file.read(&mut data[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return failure,
        }
    }
    data.truncate(read);
    Request::FileChunk {
        data_length: read as i32,
        file_length,
        data,
    }
}

/// Entry point for `sbclink run`.
pub fn run(args: RunArgs) -> DaemonResult<i32> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(socket_path) = &args.socket_path {
        config.socket_path = socket_path.clone();
    }

    let transfer_config = TransferConfig {
        ready_timeout: config.ready_timeout(),
        ..TransferConfig::default()
    };

    if args.no_spi {
        info!("running without SPI hardware (simulated firmware)");
        let (peer, _sim) = SimulatedPeer::new();
        run_with(DataTransfer::with_config(peer, transfer_config), config)
    } else {
        let open_hw = || -> DaemonResult<_> {
            let bus = SpidevBus::open(&config.spi_device, config.spi_speed_hz)?;
            let ready = SysfsReadyLine::open(config.ready_gpio)?;
            Ok(SpiLink::new(bus, ready))
        };
        let link = match open_hw() {
            Ok(link) => link,
            Err(err) => {
                write_start_error(&config.start_error_file, &err.message);
                return Err(err);
            }
        };
        run_with(DataTransfer::with_config(link, transfer_config), config)
    }
}

fn run_with<L: SpiBus + ReadyLine + Send + 'static>(
    transfer: DataTransfer<L>,
    config: Config,
) -> DaemonResult<i32> {
    let model = Arc::new(ObjectModelMirror::new());
    let (macro_tx, macro_rx) = mpsc::channel();
    let handle_slot = Arc::new(OnceLock::new());

    let sink = DaemonSink {
        model: Arc::clone(&model),
        macro_requests: macro_tx,
        files_dir: config.files_dir.clone(),
        handle: Arc::clone(&handle_slot),
    };

    let processor_config = ProcessorConfig {
        connect_timeout: config.connect_timeout(),
        ..ProcessorConfig::default()
    };
    let mut processor = Processor::with_config(transfer, Box::new(sink), processor_config);
    let handle = processor.handle();
    let _ = handle_slot.set(handle.clone());

    if let Err(err) = processor.connect() {
        write_start_error(&config.start_error_file, &err.to_string());
        return Err(err.into());
    }
    clear_start_error(&config.start_error_file);

    let _feeder = macros::spawn(handle.clone(), config.macros_dir.clone(), macro_rx)
        .map_err(|err| DaemonError::config(format!("cannot spawn macro feeder: {err}")))?;

    let server = match IpcServer::bind(&config.socket_path) {
        Ok(server) => server,
        Err(err) => {
            write_start_error(&config.start_error_file, &err.message);
            return Err(err);
        }
    };

    let shutdown = processor.shutdown_flag();
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!(%err, "cannot install signal handler");
        }
    }

    let server_thread = {
        let handle = handle.clone();
        let shutdown = Arc::clone(&shutdown);
        let reply_timeout = config.ipc_reply_timeout();
        std::thread::Builder::new()
            .name("ipc-server".into())
            .spawn(move || server.serve(handle, model, reply_timeout, shutdown))
            .map_err(|err| DaemonError::config(format!("cannot spawn ipc server: {err}")))?
    };

    let result = processor.run();
    shutdown.store(true, Ordering::SeqCst);
    let _ = server_thread.join();

    result.map(|()| SUCCESS).map_err(DaemonError::from)
}

fn write_start_error(path: &Path, reason: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(path, format!("{reason}\n")) {
        warn!(path = %path.display(), %err, "cannot write start-error file");
    }
}

fn clear_start_error(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_chunks_are_served_with_length() {
        let dir = std::env::temp_dir().join(format!("sbclink-chunk-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("firmware.bin"), b"0123456789").unwrap();

        match read_file_chunk(&dir, "firmware.bin", 2, 4) {
            Request::FileChunk {
                data_length,
                file_length,
                data,
            } => {
                assert_eq!(data_length, 4);
                assert_eq!(file_length, 10);
                assert_eq!(data, b"2345");
            }
            other => panic!("unexpected request {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_chunk_reports_failure() {
        let dir = std::env::temp_dir().join(format!("sbclink-chunk-miss-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        match read_file_chunk(&dir, "nope.bin", 0, 16) {
            Request::FileChunk { data_length, .. } => assert_eq!(data_length, -1),
            other => panic!("unexpected request {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn start_error_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("sbclink-starterr-{}", std::process::id()));
        let path = dir.join("start-error.txt");

        write_start_error(&path, "no spi device");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            "no spi device"
        );

        clear_start_error(&path);
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
