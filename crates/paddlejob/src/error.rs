use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event channel for job {job} is closed")]
    ChannelClosed { job: String },

    #[error("Timed out delivering event to job {job}")]
    SendTimeout { job: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
