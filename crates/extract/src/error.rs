#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("output buffer too small: need {needed} bytes, have {capacity}")]
    OutputOverflow { needed: usize, capacity: usize },
    #[error("NAL unit length field overruns the buffer")]
    TruncatedNalUnit,
    #[error("SEI payload size is inconsistent with the NAL unit size")]
    InvalidSeiPayload,
    #[error("NAL unit span does not lie within the access unit")]
    InvalidNalSpan,
}
