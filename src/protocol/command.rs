//! Command definitions and wire responses

/// What a single GET key refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetKey {
    /// `experiment:{id}`
    Experiment(u64),
    /// `experiment:*`
    AllExperiments,
    /// `experiment:active`
    ActiveExperiments,
    /// `{expId}:{userId}`
    Bucket { experiment_id: u64, user_id: Vec<u8> },
    /// Well-formed but names nothing that can exist, e.g. a non-numeric id.
    Unresolvable,
}

/// Header of a storage command; the payload line follows it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub bytes: usize,
    pub noreply: bool,
    /// Raw data line, filled in by the connection loop after the header parses.
    pub payload: Vec<u8>,
}

/// Supported protocol commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// GET / GETS, keeping each raw key for the VALUE echo
    Get { keys: Vec<(Vec<u8>, GetKey)> },
    /// SET / REPLACE: overwrite an existing experiment
    Set { id: u64, header: StoreHeader },
    /// ADD: create an experiment under a new id
    Add { header: StoreHeader },
    /// SET/ADD whose header framed a data line but whose key is invalid.
    /// The data line is still consumed, then answered with one `CLIENT_ERROR`.
    Rejected { header: StoreHeader, message: String },
    /// Deactivate; `None` when the key is not an id
    Delete { id: Option<u64> },
    /// Activate; `None` when the key is not an id
    Touch { id: Option<u64>, noreply: bool },
    /// Record a conversion; `None` when the experiment part is not an id
    Incr {
        experiment_id: Option<u64>,
        user_id: Vec<u8>,
    },
    /// Counters for the given experiments; `None` (no arguments) means every
    /// active one. Non-numeric arguments are dropped from the list.
    Stats { ids: Option<Vec<u64>> },
    Quit,
}

impl Command {
    /// Get command name as string
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Add { .. } => "ADD",
            Command::Rejected { .. } => "REJECTED",
            Command::Delete { .. } => "DELETE",
            Command::Touch { .. } => "TOUCH",
            Command::Incr { .. } => "INCR",
            Command::Stats { .. } => "STATS",
            Command::Quit => "QUIT",
        }
    }

    /// The store header for commands followed by a data line.
    pub fn store_header_mut(&mut self) -> Option<&mut StoreHeader> {
        match self {
            Command::Set { header, .. }
            | Command::Add { header }
            | Command::Rejected { header, .. } => Some(header),
            _ => None,
        }
    }
}

/// One protocol response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value { key: Vec<u8>, data: Vec<u8> },
    Stat { name: String, value: u64 },
    /// Bare data line, used for INCR results
    Data(String),
    End,
    Stored,
    NotStored,
    Deleted,
    Touched,
    NotFound,
    ClientError(String),
    ServerError(String),
}

impl Response {
    /// Encode as terminated protocol lines
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Response::Value { key, data } => {
                let mut out = b"VALUE ".to_vec();
                out.extend_from_slice(key);
                out.extend_from_slice(format!(" 0 {}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                out
            }
            Response::Stat { name, value } => {
                line(&format!("STAT {} {}", name.replace(':', "."), value))
            }
            Response::Data(data) => line(data),
            Response::End => line("END"),
            Response::Stored => line("STORED"),
            Response::NotStored => line("NOT_STORED"),
            Response::Deleted => line("DELETED"),
            Response::Touched => line("TOUCHED"),
            Response::NotFound => line("NOT_FOUND"),
            Response::ClientError(msg) => line(&format!("CLIENT_ERROR {}", msg)),
            Response::ServerError(msg) => line(&format!("SERVER_ERROR {}", msg)),
        }
    }
}

fn line(content: &str) -> Vec<u8> {
    format!("{}\r\n", content).into_bytes()
}
