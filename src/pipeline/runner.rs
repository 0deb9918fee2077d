//! Orders stages, manages the context, and honors early abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::PipelineContext;
use crate::logging::log_debug;
use crate::pipeline::stage::Stage;

type BeforeStageHook = Box<dyn Fn(&str, &PipelineContext) + Send + Sync>;
type AfterStageHook = Box<dyn Fn(&str, &PipelineContext, Duration) + Send + Sync>;
type OnErrorHook = Box<dyn Fn(&str, &str, &PipelineContext) + Send + Sync>;

/// Runs an ordered list of stages against a [`PipelineContext`].
///
/// The runner itself performs no I/O and holds no state between runs beyond
/// the stage list and optional hooks - everything else lives in the stages
/// themselves or in the context being threaded through.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<(String, Arc<dyn Stage>)>,
    before_stage: Option<BeforeStageHook>,
    after_stage: Option<AfterStageHook>,
    on_error: Option<OnErrorHook>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to the end of the pipeline.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        let name = stage.name().to_string();
        self.stages.push((name, stage));
        self
    }

    /// Remove a stage by name. No-op if no stage with that name is present.
    pub fn remove_stage(&mut self, name: &str) -> &mut Self {
        self.stages.retain(|(n, _)| n != name);
        self
    }

    /// List stage names in execution order.
    pub fn list_stages(&self) -> Vec<String> {
        self.stages.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn on_before_stage<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, &PipelineContext) + Send + Sync + 'static,
    {
        self.before_stage = Some(Box::new(f));
        self
    }

    pub fn on_after_stage<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, &PipelineContext, Duration) + Send + Sync + 'static,
    {
        self.after_stage = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, &str, &PipelineContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Run every stage in order against `ctx`. A stage is skipped if `ctx`
    /// is already aborted on entry. A stage returning `Err` aborts the
    /// pipeline and stops execution - it is not re-entered, and no later
    /// stage runs.
    pub async fn run(&self, ctx: &mut PipelineContext) {
        for (name, stage) in &self.stages {
            if ctx.aborted {
                break;
            }

            if let Some(hook) = &self.before_stage {
                hook(name, ctx);
            }

            let start = Instant::now();
            let result = stage.run(ctx).await;
            let elapsed = start.elapsed();

            log_debug!(stage = %name, elapsed_ms = elapsed.as_millis() as u64, "stage executed");

            if let Some(hook) = &self.after_stage {
                hook(name, ctx, elapsed);
            }

            if let Err(err) = result {
                let message = err.to_string();
                ctx.abort(format!("{name}: {message}"));
                if let Some(hook) = &self.on_error {
                    hook(name, &message, ctx);
                }
                break;
            }
        }
    }
}
