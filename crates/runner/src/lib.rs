pub mod pipeline;
pub mod provisioner;
pub mod writer;

pub use pipeline::{IngestOutcome, IngestPipeline};
pub use provisioner::{Provisioned, TableProvisioner};
pub use writer::RowWriter;
