//! Tagged checkpoint records and the registry that decodes them.
//!
//! Every line starts with a type tag. The tag picks the decoder, so new
//! record kinds (or new versions of old ones) can be added without
//! breaking existing checkpoints.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipex_core::{Resources, TaskId, TaskSnapshot, TaskState};
use tracing::debug;

use crate::codec::{FieldReader, FieldWriter};
use crate::{Result, StorageError};

/// Newest checkpoint format this build writes and reads.
pub const CURRENT_VERSION: u32 = 1;

/// Tag of the header record.
pub const TAG_HEADER: &str = "Checkpoint";
/// Tag of a task record.
pub const TAG_TASK: &str = "Task";
/// Tag of an executioner assignment record.
pub const TAG_DISPATCH: &str = "Dispatch";

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Record {
    /// Format version and creation time
    Header {
        /// Format version
        version: u32,
        /// When the checkpoint was taken
        created_at: DateTime<Utc>,
    },
    /// A task in its last saved state
    Task(Box<TaskSnapshot>),
    /// Which executioner owns a dispatched task
    Dispatch {
        /// Dispatched task
        task: TaskId,
        /// Executioner name
        executioner: String,
    },
}

/// Decodes the fields following the type tag.
pub type Decoder = fn(&mut FieldReader<'_>) -> Result<Record>;

/// Decoders keyed by type tag.
#[derive(Clone)]
pub struct RecordRegistry {
    decoders: HashMap<String, Decoder>,
}

impl RecordRegistry {
    /// Registry without any decoder.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, decoder: Decoder) -> Option<Decoder> {
        self.decoders.insert(tag.into(), decoder)
    }

    /// Known tags.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Decode one line (1-based `line`, newline stripped).
    pub fn decode_line(&self, line: usize, text: &str) -> Result<Record> {
        let mut reader = FieldReader::new(line, text);
        let tag = reader.next_raw()?;
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| reader.corrupt(format!("unknown record type '{}'", tag)))?;
        let record = decoder(&mut reader)?;
        reader.expect_end()?;
        Ok(record)
    }
}

impl Default for RecordRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TAG_HEADER, decode_header);
        registry.register(TAG_TASK, decode_task);
        registry.register(TAG_DISPATCH, decode_dispatch);
        registry
    }
}

impl std::fmt::Debug for RecordRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRegistry").field("tags", &self.tags()).finish()
    }
}

// === Encoders ===

/// Encode the header line.
pub fn encode_header(version: u32, created_at: &DateTime<Utc>) -> String {
    FieldWriter::new(TAG_HEADER)
        .value(version)
        .str(&created_at.to_rfc3339())
        .finish()
}

/// Encode a task line.
///
/// Field order: id, canFail, state, exitValue, node, queue, program file,
/// program text, stdout, stderr, exit-code file, then the resource fields
/// (cpus, mem, timeout, custom quantities), then source position, pid and
/// declared outputs.
pub fn encode_task(task: &TaskSnapshot) -> String {
    let res = &task.resources;
    let mut w = FieldWriter::new(TAG_TASK);
    w.str(task.id.as_str())
        .value(task.can_fail)
        .value(task.state)
        .value(task.exit_value)
        .opt_str(res.node.as_deref())
        .opt_str(res.queue.as_deref())
        .path(&task.program_file)
        .str(&task.program_text)
        .opt_path(task.stdout_file.as_deref())
        .opt_path(task.stderr_file.as_deref())
        .opt_path(task.exit_code_file.as_deref())
        .value(res.cpus)
        .value(res.mem_mb)
        .opt_value(res.timeout.map(|t| t.as_millis() as u64))
        .value(res.custom.len());
    for (name, amount) in &res.custom {
        w.str(name).value(amount);
    }
    w.str(&task.source_file)
        .value(task.source_line)
        .opt_str(task.pid.as_deref())
        .value(task.output_files.len());
    for file in &task.output_files {
        w.path(file);
    }
    w.finish()
}

/// Encode an executioner assignment line.
pub fn encode_dispatch(task: &TaskId, executioner: &str) -> String {
    FieldWriter::new(TAG_DISPATCH)
        .str(task.as_str())
        .str(executioner)
        .finish()
}

// === Decoders ===

fn decode_header(r: &mut FieldReader<'_>) -> Result<Record> {
    let version = r.next_parsed::<u32>()?;
    let created = r.next_str()?;
    let created_at = DateTime::parse_from_rfc3339(&created)
        .map_err(|e| r.corrupt(format!("bad timestamp '{}': {}", created, e)))?
        .with_timezone(&Utc);
    Ok(Record::Header {
        version,
        created_at,
    })
}

fn decode_task(r: &mut FieldReader<'_>) -> Result<Record> {
    let id = TaskId::from(r.next_str()?);
    let can_fail = r.next_parsed::<bool>()?;
    let state = r.next_parsed::<TaskState>()?;
    let exit_value = r.next_parsed::<i32>()?;
    let node = r.next_opt_str()?;
    let queue = r.next_opt_str()?;
    let program_file = r.next_path()?;
    let program_text = r.next_str()?;
    let stdout_file = r.next_opt_path()?;
    let stderr_file = r.next_opt_path()?;
    let exit_code_file = r.next_opt_path()?;

    let mut resources = Resources {
        cpus: r.next_parsed()?,
        mem_mb: r.next_parsed()?,
        timeout: r.next_opt_parsed::<u64>()?.map(Duration::from_millis),
        custom: BTreeMap::new(),
        node,
        queue,
    };
    let custom_count = r.next_parsed::<usize>()?;
    for _ in 0..custom_count {
        let name = r.next_str()?;
        let amount = r.next_parsed::<u64>()?;
        resources.custom.insert(name, amount);
    }

    // Records written before version 1 stop after the resources.
    let mut source_file = String::new();
    let mut source_line = 0;
    let mut pid = None;
    let mut output_files = Vec::new();
    if r.has_more() {
        source_file = r.next_str()?;
        source_line = r.next_parsed()?;
        pid = r.next_opt_str()?;
        let count = r.next_parsed::<usize>()?;
        for _ in 0..count {
            output_files.push(r.next_path()?);
        }
    }

    Ok(Record::Task(Box::new(TaskSnapshot {
        id,
        can_fail,
        state,
        exit_value,
        pid,
        source_file,
        source_line,
        program_file,
        program_text,
        stdout_file,
        stderr_file,
        exit_code_file,
        resources,
        output_files,
    })))
}

fn decode_dispatch(r: &mut FieldReader<'_>) -> Result<Record> {
    Ok(Record::Dispatch {
        task: TaskId::from(r.next_str()?),
        executioner: r.next_str()?,
    })
}

/// Every task known to a scheduler, plus the bookkeeping needed to resume
/// polling them.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Format version the checkpoint was read from or will be written as
    pub version: u32,
    /// When the checkpoint was taken; absent in headerless legacy files
    pub created_at: Option<DateTime<Utc>>,
    /// Tasks, in registration order
    pub tasks: Vec<TaskSnapshot>,
    /// Owning executioner of each dispatched task
    pub dispatch: BTreeMap<TaskId, String>,
}

impl Checkpoint {
    /// Empty checkpoint stamped now.
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION,
            created_at: Some(Utc::now()),
            tasks: Vec::new(),
            dispatch: BTreeMap::new(),
        }
    }

    /// Textual form: header, task lines, dispatch lines.
    pub fn encode(&self) -> String {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let mut out = encode_header(CURRENT_VERSION, &created_at);
        for task in &self.tasks {
            out.push_str(&encode_task(task));
        }
        for (task, executioner) in &self.dispatch {
            out.push_str(&encode_dispatch(task, executioner));
        }
        out
    }

    /// Parse a checkpoint. Any undecodable line fails the whole parse.
    pub fn decode(text: &str, registry: &RecordRegistry) -> Result<Self> {
        let mut checkpoint = Checkpoint {
            version: 0,
            created_at: None,
            tasks: Vec::new(),
            dispatch: BTreeMap::new(),
        };
        let mut seen = HashSet::new();
        let mut first = true;

        for (idx, text) in text.lines().enumerate() {
            let line = idx + 1;
            if text.trim().is_empty() {
                continue;
            }
            let corrupt = |reason: String| StorageError::CorruptCheckpoint { line, reason };

            match registry.decode_line(line, text)? {
                Record::Header {
                    version,
                    created_at,
                } => {
                    if !first {
                        return Err(corrupt("header must be the first record".to_string()));
                    }
                    if version > CURRENT_VERSION {
                        return Err(StorageError::UnsupportedVersion {
                            found: version,
                            supported: CURRENT_VERSION,
                        });
                    }
                    checkpoint.version = version;
                    checkpoint.created_at = Some(created_at);
                }
                Record::Task(task) => {
                    if !seen.insert(task.id.clone()) {
                        return Err(corrupt(format!("duplicate task id '{}'", task.id)));
                    }
                    checkpoint.tasks.push(*task);
                }
                Record::Dispatch { task, executioner } => {
                    if !seen.contains(&task) {
                        return Err(corrupt(format!("dispatch entry for unknown task '{}'", task)));
                    }
                    checkpoint.dispatch.insert(task, executioner);
                }
            }
            first = false;
        }

        debug!(
            "decoded checkpoint v{} with {} task(s)",
            checkpoint.version,
            checkpoint.tasks.len()
        );
        Ok(checkpoint)
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}
