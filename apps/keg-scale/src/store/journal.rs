use super::MeasurementStore;
use crate::scale::Measurement;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

const JOURNAL_MAGIC: &[u8; 8] = b"KEGJRNL1";
const JOURNAL_VERSION: u32 = 1;
const JOURNAL_HEADER_LEN: usize = 16;
const RECORD_LEN: usize = 28;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 1024;

const JOURNAL_FILE: &str = "measurements.journal";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct JournalStateDisk {
    active_keg: Option<i64>,
}

#[derive(Debug)]
enum JournalCommand {
    Append {
        measurement: Measurement,
        respond_to: oneshot::Sender<Result<()>>,
    },
    LoadRecent {
        respond_to: oneshot::Sender<Vec<Measurement>>,
    },
    SetActiveKeg {
        keg: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    GetActiveKeg {
        respond_to: oneshot::Sender<Option<i64>>,
    },
}

/// Append-only measurement journal owned by a dedicated writer thread.
#[derive(Clone)]
pub struct JournalStore {
    tx: mpsc::UnboundedSender<JournalCommand>,
}

impl JournalStore {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> JournalCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| anyhow!("journal thread stopped"))?;
        rx.await.context("journal thread dropped response")
    }
}

#[async_trait]
impl MeasurementStore for JournalStore {
    async fn save_measurement(&self, measurement: &Measurement) -> Result<()> {
        let measurement = *measurement;
        self.request(|respond_to| JournalCommand::Append {
            measurement,
            respond_to,
        })
        .await?
    }

    async fn load_recent_measurements(&self) -> Result<Vec<Measurement>> {
        self.request(|respond_to| JournalCommand::LoadRecent { respond_to })
            .await
    }

    async fn save_active_keg(&self, keg: i64) -> Result<()> {
        self.request(|respond_to| JournalCommand::SetActiveKeg { keg, respond_to })
            .await?
    }

    async fn load_active_keg(&self) -> Result<Option<i64>> {
        self.request(|respond_to| JournalCommand::GetActiveKeg { respond_to })
            .await
    }
}

/// Opens (or creates) the journal in `data_dir` and hands it to a writer thread.
/// Opening happens on the caller's thread so a broken data dir fails startup.
pub fn spawn_journal_thread(data_dir: &Path, retention: usize) -> Result<JournalStore> {
    let runtime = JournalRuntime::open(data_dir, retention)?;
    tracing::info!(
        path = %runtime.journal_path.display(),
        records = runtime.records,
        retained = runtime.recent.len(),
        "measurement journal opened"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<JournalCommand>();
    std::thread::Builder::new()
        .name("journal-writer".to_string())
        .spawn(move || run_journal_thread(runtime, &mut rx))
        .context("failed to spawn journal thread")?;

    Ok(JournalStore { tx })
}

fn run_journal_thread(
    mut runtime: JournalRuntime,
    rx: &mut mpsc::UnboundedReceiver<JournalCommand>,
) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            JournalCommand::Append {
                measurement,
                respond_to,
            } => {
                let _ = respond_to.send(runtime.append(measurement));
            }
            JournalCommand::LoadRecent { respond_to } => {
                let _ = respond_to.send(runtime.recent.iter().copied().collect());
            }
            JournalCommand::SetActiveKeg { keg, respond_to } => {
                let _ = respond_to.send(runtime.set_active_keg(keg));
            }
            JournalCommand::GetActiveKeg { respond_to } => {
                let _ = respond_to.send(runtime.active_keg);
            }
        }
    }
    tracing::debug!("journal thread exiting");
}

struct JournalRuntime {
    journal_path: PathBuf,
    state_path: PathBuf,
    file: fs::File,
    retention: usize,
    /// Frames currently in the file, including ones older than the retention window.
    records: usize,
    recent: VecDeque<Measurement>,
    active_keg: Option<i64>,
}

impl JournalRuntime {
    fn open(data_dir: &Path, retention: usize) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let retention = retention.max(1);
        let journal_path = data_dir.join(JOURNAL_FILE);
        let state_path = data_dir.join(STATE_FILE);

        let (file, records, recent) = if journal_path.exists() {
            open_existing_journal(&journal_path, retention)?
        } else {
            (create_journal(&journal_path)?, 0, VecDeque::new())
        };

        let active_keg = load_state(&state_path)
            .unwrap_or_else(|err| {
                tracing::warn!(
                    error=%err,
                    "failed to load journal state; starting without active keg"
                );
                JournalStateDisk::default()
            })
            .active_keg;

        let mut runtime = Self {
            journal_path,
            state_path,
            file,
            retention,
            records,
            recent,
            active_keg,
        };
        runtime.compact_if_needed()?;
        Ok(runtime)
    }

    fn append(&mut self, measurement: Measurement) -> Result<()> {
        let frame = encode_frame(&encode_record(&measurement));
        self.write_or_rollback(|file| {
            file.write_all(&frame)?;
            file.sync_data().context("sync journal")
        })?;
        self.records = self.records.saturating_add(1);
        self.recent.push_back(measurement);
        while self.recent.len() > self.retention {
            self.recent.pop_front();
        }
        self.compact_if_needed()
    }

    /// Runs `write` at the end of the journal. On failure the file is cut back to its
    /// previous length so a half-written frame never sits in front of later records.
    fn write_or_rollback(
        &mut self,
        write: impl FnOnce(&mut fs::File) -> Result<()>,
    ) -> Result<()> {
        let start = self.file.metadata().context("stat journal")?.len();
        let Err(err) = write(&mut self.file) else {
            return Ok(());
        };

        let rollback = self
            .file
            .set_len(start)
            .and_then(|()| self.file.seek(SeekFrom::End(0)));
        if let Err(rollback_err) = rollback {
            tracing::error!(
                error=%rollback_err,
                path = %self.journal_path.display(),
                "failed to roll back partial journal write"
            );
            return Err(err.context(format!("journal left unrepaired: {rollback_err}")));
        }
        Err(err)
    }

    fn compact_if_needed(&mut self) -> Result<()> {
        if self.records <= self.retention.saturating_mul(2) {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrites the journal with only the retained window, via temp file + rename.
    fn compact(&mut self) -> Result<()> {
        let tmp = self.journal_path.with_extension("journal.tmp");
        {
            let mut out = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            let mut buf = journal_header();
            for measurement in &self.recent {
                buf.put(encode_frame(&encode_record(measurement)));
            }
            out.write_all(&buf)?;
            out.sync_data().context("sync compacted journal")?;
        }
        fs::rename(&tmp, &self.journal_path).with_context(|| {
            format!(
                "rename {} -> {}",
                tmp.display(),
                self.journal_path.display()
            )
        })?;

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.journal_path)
            .with_context(|| format!("open {}", self.journal_path.display()))?;
        file.seek(SeekFrom::End(0))?;

        tracing::debug!(
            dropped = self.records.saturating_sub(self.recent.len()),
            "compacted journal"
        );
        self.file = file;
        self.records = self.recent.len();
        Ok(())
    }

    fn set_active_keg(&mut self, keg: i64) -> Result<()> {
        persist_state(
            &self.state_path,
            &JournalStateDisk {
                active_keg: Some(keg),
            },
        )?;
        self.active_keg = Some(keg);
        Ok(())
    }
}

fn create_journal(path: &Path) -> Result<fs::File> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(&journal_header())?;
    file.sync_data().ok();
    Ok(file)
}

fn open_existing_journal(
    path: &Path,
    retention: usize,
) -> Result<(fs::File, usize, VecDeque<Measurement>)> {
    let data = Bytes::from(fs::read(path).with_context(|| format!("read {}", path.display()))?);
    let mut rest =
        journal_body(&data).with_context(|| format!("invalid journal {}", path.display()))?;

    let mut records = 0usize;
    let mut recent = VecDeque::with_capacity(retention);
    loop {
        let before = rest.clone();
        let Some(measurement) = next_frame(&mut rest).and_then(|payload| decode_record(&payload))
        else {
            rest = before;
            break;
        };
        records += 1;
        recent.push_back(measurement);
        if recent.len() > retention {
            recent.pop_front();
        }
    }

    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;

    // Anything after the last good frame is a torn write from a crash.
    if !rest.is_empty() {
        let valid_end = (data.len() - rest.len()) as u64;
        tracing::warn!(
            path = %path.display(),
            truncated_bytes = rest.len(),
            "truncating torn journal tail"
        );
        file.set_len(valid_end)?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok((file, records, recent))
}

fn journal_header() -> BytesMut {
    let mut buf = BytesMut::with_capacity(JOURNAL_HEADER_LEN);
    buf.put_slice(JOURNAL_MAGIC);
    buf.put_u32_le(JOURNAL_VERSION);
    buf.put_u32_le(JOURNAL_HEADER_LEN as u32);
    buf
}

/// Validates the header and returns everything after it.
fn journal_body(data: &Bytes) -> Result<Bytes> {
    if data.len() < JOURNAL_HEADER_LEN {
        bail!("journal too small");
    }
    let mut header = data.slice(..JOURNAL_HEADER_LEN);
    if header.split_to(JOURNAL_MAGIC.len()) != JOURNAL_MAGIC.as_slice() {
        bail!("bad journal magic");
    }
    let version = header.get_u32_le();
    if version != JOURNAL_VERSION {
        bail!("unsupported journal version {version}");
    }
    let header_len = header.get_u32_le() as usize;
    if header_len < JOURNAL_HEADER_LEN || header_len > data.len() {
        bail!("bad journal header length {header_len}");
    }
    Ok(data.slice(header_len..))
}

fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_u32_le(crc32c(payload));
    frame.put_slice(payload);
    frame
}

/// Splits the next intact frame off `buf`. Leaves `buf` untouched when the frame is
/// short, oversized or fails its checksum.
fn next_frame(buf: &mut Bytes) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut header = &buf[..FRAME_HEADER_LEN];
    let len = header.get_u32_le() as usize;
    let crc = header.get_u32_le();
    if len == 0 || len > MAX_FRAME_LEN || buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    let payload = buf.slice(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len);
    if crc32c(&payload) != crc {
        return None;
    }
    buf.advance(FRAME_HEADER_LEN + len);
    Some(payload)
}

fn encode_record(measurement: &Measurement) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RECORD_LEN);
    buf.put_u64_le(measurement.seq);
    buf.put_u32_le(measurement.slot_index as u32);
    buf.put_i64_le(measurement.recorded_at.timestamp_millis());
    buf.put_f64_le(measurement.weight);
    buf
}

fn decode_record(mut buf: &[u8]) -> Option<Measurement> {
    if buf.len() != RECORD_LEN {
        return None;
    }
    let seq = buf.get_u64_le();
    let slot_index = buf.get_u32_le() as usize;
    let recorded_at = Utc.timestamp_millis_opt(buf.get_i64_le()).single()?;
    let weight = buf.get_f64_le();
    Some(Measurement {
        seq,
        slot_index,
        weight,
        recorded_at,
    })
}

fn load_state(path: &Path) -> Result<JournalStateDisk> {
    if !path.exists() {
        return Ok(JournalStateDisk::default());
    }
    let raw = fs::read_to_string(path).context("read journal state")?;
    serde_json::from_str(&raw).context("parse journal state")
}

fn persist_state(path: &Path, state: &JournalStateDisk) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(state)?).context("write state tmp")?;
    fs::rename(&tmp, path).context("rename state")?;
    Ok(())
}
