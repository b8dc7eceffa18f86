//! Parser for text protocol command lines

use crate::protocol::command::{GetKey, StoreHeader};
use crate::protocol::Command;
use crate::{Error, Result};
use tracing::debug;

pub struct Parser;

impl Parser {
    /// Parse one request line. Blank lines yield `Ok(None)`.
    ///
    /// `Error::Parse` carries the message sent back as `CLIENT_ERROR`.
    pub fn parse_line(line: &[u8]) -> Result<Option<Command>> {
        let mut tokens = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|t| !t.is_empty());

        let verb = match tokens.next() {
            Some(verb) => verb.to_ascii_lowercase(),
            None => return Ok(None),
        };
        let args: Vec<&[u8]> = tokens.collect();

        let command = match verb.as_slice() {
            b"get" | b"gets" => Self::parse_get(&args)?,
            b"set" | b"replace" => Self::parse_set(&args)?,
            b"add" => Self::parse_add(&args)?,
            b"delete" => Self::parse_delete(&args)?,
            b"touch" => Self::parse_touch(&args)?,
            b"incr" => Self::parse_incr(&args)?,
            b"stats" => Command::Stats {
                ids: (!args.is_empty())
                    .then(|| args.iter().filter_map(|a| parse_u64(a)).collect()),
            },
            b"quit" => Command::Quit,
            b"decr" | b"flush" | b"flush_all" | b"append" | b"prepend" | b"cas" => {
                debug!("Command {} Not Implemented", String::from_utf8_lossy(&verb));
                return Err(Error::Parse("Command Not Implemented".to_string()));
            }
            _ => {
                debug!("Command {} Unknown", String::from_utf8_lossy(&verb));
                return Err(Error::Parse("Unknown Command".to_string()));
            }
        };

        Ok(Some(command))
    }

    fn parse_get(args: &[&[u8]]) -> Result<Command> {
        if args.is_empty() {
            return Err(Error::Parse(
                "GET Command needs at least 1 '<experiment>:<user_id>' pair".to_string(),
            ));
        }

        let keys = args
            .iter()
            .map(|raw| Self::parse_get_key(raw).map(|key| (raw.to_vec(), key)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Command::Get { keys })
    }

    fn parse_get_key(raw: &[u8]) -> Result<GetKey> {
        let (prefix, rest) = split_key(raw).ok_or_else(|| {
            Error::Parse("GET argument must be in the format '<experiment>:<user_id>'".to_string())
        })?;

        if prefix.eq_ignore_ascii_case(b"experiment") {
            return Ok(match rest {
                b"*" => GetKey::AllExperiments,
                b"active" => GetKey::ActiveExperiments,
                id => parse_u64(id).map_or(GetKey::Unresolvable, GetKey::Experiment),
            });
        }

        Ok(match parse_u64(prefix) {
            Some(experiment_id) => GetKey::Bucket {
                experiment_id,
                user_id: rest.to_vec(),
            },
            None => GetKey::Unresolvable,
        })
    }

    fn parse_store_header(verb: &str, args: &[&[u8]]) -> Result<StoreHeader> {
        if args.len() < 4 {
            return Err(Error::Parse(format!(
                "{} Command needs at least 4 arguments, <key> <flags> <exptime> <bytes> [noreply]",
                verb
            )));
        }

        let bytes = parse_u64(args[3])
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::Parse("bad data chunk length".to_string()))?;

        Ok(StoreHeader {
            bytes,
            noreply: has_noreply(args.get(4)),
            payload: Vec::new(),
        })
    }

    // Once the header frames a data line, key errors become `Command::Rejected`
    // so the line is still read off the wire.
    fn parse_set(args: &[&[u8]]) -> Result<Command> {
        let header = Self::parse_store_header("SET", args)?;
        Ok(match parse_u64(args[0]).filter(|id| *id > 0) {
            Some(id) => Command::Set { id, header },
            None => Command::Rejected {
                header,
                message: "SET key must be a positive integer".to_string(),
            },
        })
    }

    fn parse_add(args: &[&[u8]]) -> Result<Command> {
        let header = Self::parse_store_header("ADD", args)?;
        // The key is never used as an id; it only has to look like one.
        Ok(match parse_u64(args[0]) {
            Some(_) => Command::Add { header },
            None => Command::Rejected {
                header,
                message: "ADD key must be an unsigned integer".to_string(),
            },
        })
    }

    fn parse_delete(args: &[&[u8]]) -> Result<Command> {
        match args.first() {
            Some(key) => Ok(Command::Delete { id: parse_u64(key) }),
            None => Err(Error::Parse(
                "DELETE command takes 1 argument <key>".to_string(),
            )),
        }
    }

    fn parse_touch(args: &[&[u8]]) -> Result<Command> {
        if args.len() < 2 {
            return Err(Error::Parse(
                "TOUCH command takes at least 2 arguments <key> <exptime> [noreply]".to_string(),
            ));
        }
        Ok(Command::Touch {
            id: parse_u64(args[0]),
            noreply: has_noreply(args.get(2)),
        })
    }

    fn parse_incr(args: &[&[u8]]) -> Result<Command> {
        let key = args.first().ok_or_else(|| {
            Error::Parse("INCR command needs at least 1 argument <key> [delta]".to_string())
        })?;
        let (prefix, user_id) = split_key(key).ok_or_else(|| {
            Error::Parse("INCR key must be in the format '<experiment>:<user_id>'".to_string())
        })?;
        // Delta is accepted for compatibility and has no effect.
        if let Some(delta) = args.get(1) {
            parse_u64(delta)
                .ok_or_else(|| Error::Parse("invalid numeric delta argument".to_string()))?;
        }

        Ok(Command::Incr {
            experiment_id: parse_u64(prefix),
            user_id: user_id.to_vec(),
        })
    }
}

/// Split `prefix:rest` at the first colon. The rest may itself contain colons.
fn split_key(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = raw.iter().position(|b| *b == b':')?;
    Some((&raw[..pos], &raw[pos + 1..]))
}

fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn has_noreply(arg: Option<&&[u8]>) -> bool {
    arg.is_some_and(|a| a.eq_ignore_ascii_case(b"noreply"))
}
