use thiserror::Error;

/// Result alias for scanner operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Errors that can occur while aligning and scoring a ballot image.
#[derive(Debug, Error)]
pub enum ScanError {
    /// An image or JSON input could not be decoded.
    #[error("undecodable input: {0}")]
    InputDecode(String),

    /// The reference rendering or bubble geometry is unusable.
    #[error("reference geometry invalid: {0}")]
    ReferenceGeometryInvalid(String),

    /// The luma histogram contained no pixels.
    #[error("empty histogram")]
    EmptyHistogram,

    /// Too few edge hits to fit the top line.
    #[error("top line not found: {hits} hits, {misses} misses")]
    EdgeDetectionMiss { hits: usize, misses: usize },

    /// The least-squares denominator was degenerate.
    #[error("line fit failed")]
    LineFitFailed,

    /// The recovered similarity transform is unusable.
    #[error("degenerate transform: scale {scale}")]
    TransformDegenerate { scale: f64 },

    /// The scanned frame cannot host the sampling pattern.
    #[error("input geometry mismatch: {0}")]
    InputGeometryMismatch(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("configuration: {0}")]
    Config(String),
}
