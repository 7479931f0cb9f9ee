//! Nomina Core Library
//!
//! Cross-domain formula evolution and invariant discovery: domains are
//! registered behind adapters, a population of scoring formulas is
//! correlated with every domain's outcome, evolved by sample-weighted
//! fitness, and mined for recurring ratios. The [`Scheduler`] runs this
//! pipeline as daily, weekly and on-demand triggers and persists one
//! report per run.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod evaluator;
pub mod evolution;
pub mod features;
pub mod formula_registry;
pub mod invariants;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod snapshot;
pub mod stats;
pub mod telemetry;

pub use adapters::{
    DomainAdapter, DomainDescriptor, InMemoryDomain, JsonFileDomain, OutcomeDefinition,
    OutcomeKind,
};
pub use cache::{CacheLookup, EvaluationCache};
pub use config::{
    EngineConfig, EvolutionConfig, InvariantConfig, ReportConfig, SchedulerConfig,
};
pub use domain::{
    AdapterError, CacheError, CacheKey, CellError, ConfigError, DomainId, EngineError,
    EvaluationResult, FeatureError, Formula, FormulaError, FormulaId, FormulaTerm, Generation,
    RankedFormula, RegistryError, Result, TermOp,
};
pub use evaluator::{aggregate_fitness, CorrelationEvaluator, FitnessMatrix};
pub use evolution::{EvolutionCycle, EvolutionEngine, EvolutionState, StopReason};
pub use features::{
    FeatureCache, FeatureProvider, FeatureVector, LexicalFeatureProvider, StaticFeatureProvider,
};
pub use formula_registry::FormulaRegistry;
pub use invariants::{Invariant, InvariantDetector, InvariantReport, ObservationKind};
pub use pool::{CancelHandle, RunControl};
pub use registry::{DomainInfo, DomainRegistry, DomainStatus};
pub use report::{
    AnalysisReport, AnalysisRun, DomainReport, DomainRunStatus, RunStatus, RunStatusSummary,
    TriggerMode,
};
pub use scheduler::{ReproducibilityCheck, Scheduler};
pub use snapshot::DomainSnapshot;

pub use nomina_store::{MemoryResultStore, ResultStore, RunId, StoreConfig, SurrealResultStore};
