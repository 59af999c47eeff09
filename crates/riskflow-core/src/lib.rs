pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod orchestrator;
pub mod preprocess;
pub mod provider;
pub mod report;
pub mod task;

pub use config::EngineConfig;
pub use error::EngineError;
pub use extract::{AnalysisResult, RiskBand, RiskFinding};
pub use gateway::{
    DocumentResolver, Engine, EngineMetrics, FsDocumentResolver, MemoryDocumentResolver,
    SubmitRequest, TaskStatusView,
};
pub use preprocess::{DocumentFormat, DocumentUnreadable, TextSegment};
pub use provider::{
    ProviderAdapter, ProviderConfig, ProviderDescriptor, ProviderError, ProviderHealth,
    ProviderKind, ProviderTable, RawModelOutput,
};
pub use report::{render_providers, render_report, OutputFormat};
pub use task::{AnalysisType, RiskCategory, TaskFailure, TaskId, TaskStatus};
