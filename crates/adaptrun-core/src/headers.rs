//! Header keys shared between the inbound delivery and the outbound reply.

/// Identifies the file being adapted; required on every delivery.
pub const FILE_ID: &str = "file-id";

/// Presigned URL locating the source artifact; required on every delivery.
pub const SOURCE_URL: &str = "source-file-presigned-url";

/// Optional "true"/"false" flag; absent means "false".
pub const GENERATE_REPORT: &str = "generate-report";

/// Added to the reply headers once the output artifact has been uploaded.
pub const OUTPUT_URL: &str = "output-presigned-url";
