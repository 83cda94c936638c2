use thiserror::Error;

/// Errores del núcleo de reproducción.
///
/// Todos son recuperables a nivel de sesión: la capa de comandos los muestra
/// al usuario y la sesión sigue viva. `Clone` permite que varios comandos que
/// esperaban la misma reconexión reciban el mismo fallo.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MusicError {
    #[error("no audio node is reachable: {0}")]
    NodeUnavailable(String),

    #[error("no healthy audio node is registered")]
    NoNodeAvailable,

    #[error("no results for `{0}`")]
    NoResults(String),

    #[error("track resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("position {index} is out of range (queue has {len} tracks)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("you need to join a voice channel first")]
    NotInVoice,

    #[error("this command only works in <#{0}>")]
    WrongTextChannel(u64),

    #[error("you and the bot must be in the same voice channel (bot is in <#{0}>)")]
    WrongVoiceChannel(u64),

    #[error("the queue is full ({0} tracks max)")]
    QueueFull(usize),

    #[error("voice connection failed: {0}")]
    Voice(String),

    #[error("audio node request failed: {0}")]
    Transport(String),

    #[error("operation cancelled because the session was torn down")]
    Cancelled,
}

pub type MusicResult<T> = std::result::Result<T, MusicError>;

impl From<reqwest::Error> for MusicError {
    fn from(e: reqwest::Error) -> Self {
        MusicError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for MusicError {
    fn from(e: serde_json::Error) -> Self {
        MusicError::Transport(format!("malformed node payload: {e}"))
    }
}
