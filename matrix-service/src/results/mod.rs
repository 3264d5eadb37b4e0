// Results Module
// Naming, aggregation, on-disk layout, and reporting of check results

pub mod aggregate;
pub mod reporter;

pub use aggregate::{Aggregator, Discriminator, NameFn, ResultName, ResultSet, Summary, SummaryRow};
pub use reporter::{ReportFormat, ResultReporter};
