pub type QuellResult<T> = Result<T, QuellError>;

#[derive(thiserror::Error, Debug)]
pub enum QuellError {
    #[error("couldn't find file: {0}")]
    MissingFile(String),

    #[error("couldn't open file: {0}")]
    Open(String),

    #[error("failed to read image: {0}")]
    Read(String),

    #[error("failed to write image: {0}")]
    Write(String),

    #[error("failed to replace output: {0}")]
    Rename(String),

    #[error("no denoisable render layer: {0}")]
    NoLayers(String),

    #[error("neighbor frame mismatch: {0}")]
    NeighborMismatch(String),

    #[error("missing sample metadata: {0}")]
    MissingSamples(String),

    #[error("frame cap exceeded: {0}")]
    FrameCap(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QuellError {
    pub fn missing_file(msg: impl Into<String>) -> Self {
        Self::MissingFile(msg.into())
    }

    pub fn open(msg: impl Into<String>) -> Self {
        Self::Open(msg.into())
    }

    pub fn read(msg: impl Into<String>) -> Self {
        Self::Read(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn rename(msg: impl Into<String>) -> Self {
        Self::Rename(msg.into())
    }

    pub fn no_layers(msg: impl Into<String>) -> Self {
        Self::NoLayers(msg.into())
    }

    pub fn neighbor_mismatch(msg: impl Into<String>) -> Self {
        Self::NeighborMismatch(msg.into())
    }

    pub fn missing_samples(msg: impl Into<String>) -> Self {
        Self::MissingSamples(msg.into())
    }

    pub fn frame_cap(msg: impl Into<String>) -> Self {
        Self::FrameCap(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
