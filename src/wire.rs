use std::time::Duration;

pub const HELLO: &[u8] = b"hello";
pub const OK: &[u8] = b"ok";
pub const RETRY: &[u8] = b"retry";

// Error payloads are byte-exact for wire compatibility.
pub const ERR_NOT_HELD: &[u8] = b"error: lock not held";
pub const ERR_INVALID_REENTRY: &[u8] =
    b"error: lock already held read-only, cannot re-enter as writer";
pub const ERR_CONCURRENT: &[u8] =
    b"error: multiple concurrent requests with same key and client_id";
pub const ERR_INVALID_COMMAND: &[u8] = b"error: invalid command";
pub const ERR_WRONG_NUM_ARGS: &[u8] = b"error: wrong number of arguments";
pub const ERR_TIMEOUT_INVALID: &[u8] = b"error: timeout not a valid number";
pub const ERR_READ_ONLY_WRONG: &[u8] = b"error: argument 4 if present can only 'read_only'";

/// Leases longer than this are clamped so deadline arithmetic cannot
/// overflow the monotonic clock.
const MAX_TIMEOUT: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello,
    Acquire {
        key: Vec<u8>,
        client_id: Vec<u8>,
        timeout: Duration,
        read_only: bool,
    },
    Release {
        key: Vec<u8>,
        client_id: Vec<u8>,
    },
    Stop,
}

/// Why a command failed validation. Each variant maps onto one wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    WrongNumArgs,
    TimeoutInvalid,
    ReadOnlyWrong,
    UnknownCommand,
}

impl CommandError {
    pub fn reply(&self) -> &'static [u8] {
        match self {
            CommandError::WrongNumArgs => ERR_WRONG_NUM_ARGS,
            CommandError::TimeoutInvalid => ERR_TIMEOUT_INVALID,
            CommandError::ReadOnlyWrong => ERR_READ_ONLY_WRONG,
            CommandError::UnknownCommand => ERR_INVALID_COMMAND,
        }
    }
}

/// Parse `[command, arg…]` frames. The caller has already stripped the
/// routing id and the empty delimiter frame.
pub fn parse(frames: &[Vec<u8>]) -> Result<Command, CommandError> {
    let (command, args) = frames.split_first().ok_or(CommandError::UnknownCommand)?;
    match command.as_slice() {
        // `hello` and `stop` ignore any extra frames.
        b"hello" => Ok(Command::Hello),
        b"stop" => Ok(Command::Stop),
        b"acquire" => parse_acquire(args),
        b"release" => parse_release(args),
        _ => Err(CommandError::UnknownCommand),
    }
}

fn parse_acquire(args: &[Vec<u8>]) -> Result<Command, CommandError> {
    if !(3..=4).contains(&args.len()) {
        return Err(CommandError::WrongNumArgs);
    }
    let timeout = parse_timeout(&args[2])?;
    let read_only = match args.get(3) {
        None => false,
        Some(arg) if arg.as_slice() == b"read_only" => true,
        Some(_) => return Err(CommandError::ReadOnlyWrong),
    };
    Ok(Command::Acquire {
        key: args[0].clone(),
        client_id: args[1].clone(),
        timeout,
        read_only,
    })
}

fn parse_release(args: &[Vec<u8>]) -> Result<Command, CommandError> {
    match args {
        [key, client_id] => Ok(Command::Release {
            key: key.clone(),
            client_id: client_id.clone(),
        }),
        _ => Err(CommandError::WrongNumArgs),
    }
}

fn parse_timeout(raw: &[u8]) -> Result<Duration, CommandError> {
    let text = std::str::from_utf8(raw).map_err(|_| CommandError::TimeoutInvalid)?;
    let seconds: f64 = text.trim().parse().map_err(|_| CommandError::TimeoutInvalid)?;
    if !seconds.is_finite() {
        return Err(CommandError::TimeoutInvalid);
    }
    // A negative lease behaves like zero: it expires on the next loop pass.
    Ok(Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(MAX_TIMEOUT))
}
