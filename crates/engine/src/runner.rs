//! Drives a grid batch through the cache and the progress tracker.
//!
//! The runner owns no state between batches; it borrows the shared cache
//! manager and tracker from the runtime. Rendering itself is delegated to a
//! [`CellRenderer`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use xyzgrid_cache::CacheManager;
use xyzgrid_core::grid::{AxisKind, GridCell, GridPlan};
use xyzgrid_core::load_order::{cluster_by, CachingStrategy};
use xyzgrid_core::progress::{GridUpdate, PreviewImage};
use xyzgrid_core::types::{new_batch_id, BatchId};
use xyzgrid_core::CoreError;
use xyzgrid_events::ProgressTracker;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to load model '{name}': {reason}")]
    Load { name: String, reason: String },

    #[error("Render failed: {0}")]
    Render(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Invalid grid plan: {0}")]
    InvalidPlan(#[from] CoreError),

    #[error("Grid has {0} cells, too many to track")]
    TooLarge(usize),

    #[error("Cell {0} has no checkpoint and no default model was given")]
    MissingModel(usize),

    #[error("Cell {index} failed: {source}")]
    Cell {
        index: usize,
        #[source]
        source: RenderError,
    },
}

/// Loads models and renders single grid cells.
#[async_trait]
pub trait CellRenderer: Send + Sync {
    type Model: Send + Sync + 'static;

    async fn load_model(&self, name: &str) -> Result<Self::Model, RenderError>;

    async fn render(
        &self,
        model: &Self::Model,
        cell: &GridCell,
    ) -> Result<PreviewImage, RenderError>;
}

#[derive(Debug, Clone)]
pub struct RenderedCell {
    pub index: usize,
    pub model: String,
    pub labels: BTreeMap<String, String>,
    pub image: PreviewImage,
}

#[derive(Debug, Clone)]
pub struct GridOutcome {
    pub batch_id: BatchId,
    /// Rendered cells in scan order.
    pub images: Vec<RenderedCell>,
    /// Number of times a model had to be loaded through the renderer.
    pub model_loads: usize,
    pub strategy: CachingStrategy,
}

pub struct GridRunner<R: CellRenderer, V, L> {
    renderer: R,
    cache: Arc<CacheManager<R::Model, V, L>>,
    tracker: Arc<ProgressTracker>,
}

/// The model currently bound to the renderer.
struct CurrentModel<M> {
    name: String,
    handle: Arc<M>,
}

impl<R, V, L> GridRunner<R, V, L>
where
    R: CellRenderer,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    pub fn new(
        renderer: R,
        cache: Arc<CacheManager<R::Model, V, L>>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            renderer,
            cache,
            tracker,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Run `plan` under a freshly generated batch id.
    pub async fn run_new(
        &self,
        plan: &GridPlan,
        default_model: Option<&str>,
    ) -> Result<GridOutcome, RunnerError> {
        self.run(new_batch_id(), plan, default_model).await
    }

    /// Render every cell of `plan`, reporting progress under `batch_id`.
    ///
    /// Cells without a checkpoint axis value use `default_model`. Plan
    /// errors are returned before the batch is started; a load or render
    /// failure marks the batch failed and stops the run.
    pub async fn run(
        &self,
        batch_id: impl Into<BatchId>,
        plan: &GridPlan,
        default_model: Option<&str>,
    ) -> Result<GridOutcome, RunnerError> {
        let batch_id = batch_id.into();
        plan.validate()?;

        let cells = plan.cells();
        let total = u32::try_from(cells.len()).map_err(|_| RunnerError::TooLarge(cells.len()))?;

        let mut work = Vec::with_capacity(cells.len());
        for cell in cells {
            let model = cell
                .resource(&AxisKind::Checkpoint)
                .or(default_model)
                .ok_or(RunnerError::MissingModel(cell.index))?
                .to_string();
            work.push((model, cell));
        }

        let strategy = {
            let model_ids: Vec<&str> = work.iter().map(|(m, _)| m.as_str()).collect();
            let vae_ids: Vec<&str> = work
                .iter()
                .filter_map(|(_, c)| c.resource(&AxisKind::Vae))
                .collect();
            self.cache.suggest_strategy(&model_ids, &vae_ids)
        };
        if !strategy.memory_sufficient {
            work = cluster_by(work, |(model, _)| model.clone());
        }

        self.tracker.start(batch_id.clone(), total);

        let mut current: Option<CurrentModel<R::Model>> = None;
        let mut model_loads = 0;
        let mut images = Vec::with_capacity(work.len());

        for (model_name, cell) in work {
            let handle = match self.acquire(&model_name, &mut current, &mut model_loads).await {
                Ok(handle) => handle,
                Err(e) => return Err(self.fail(&batch_id, cell.index, e)),
            };

            let image = match self.renderer.render(&handle, &cell).await {
                Ok(image) => image,
                Err(e) => return Err(self.fail(&batch_id, cell.index, e)),
            };

            self.tracker.update(
                &batch_id,
                GridUpdate::step()
                    .with_labels(cell.labels.clone())
                    .with_preview(image.clone()),
            );

            images.push(RenderedCell {
                index: cell.index,
                model: model_name,
                labels: cell.labels,
                image,
            });
        }

        images.sort_by_key(|c| c.index);
        tracing::info!(
            batch_id = %batch_id,
            images = images.len(),
            model_loads,
            "Grid run finished",
        );

        Ok(GridOutcome {
            batch_id,
            images,
            model_loads,
            strategy,
        })
    }

    /// The model named `name`: the current one, a cached one, or a fresh
    /// load that is offered to the cache.
    async fn acquire(
        &self,
        name: &str,
        current: &mut Option<CurrentModel<R::Model>>,
        model_loads: &mut usize,
    ) -> Result<Arc<R::Model>, RenderError> {
        if let Some(cur) = current.as_ref().filter(|c| c.name == name) {
            return Ok(Arc::clone(&cur.handle));
        }

        let handle = match self.cache.get_model(name) {
            Some(handle) => {
                tracing::debug!(model = name, "Using cached model");
                handle
            }
            None => {
                let handle = Arc::new(self.renderer.load_model(name).await?);
                *model_loads += 1;
                if !self.cache.cache_model(name, Arc::clone(&handle)) {
                    tracing::debug!(
                        model = name,
                        "Model not cached; holding it for the current run only",
                    );
                }
                handle
            }
        };

        *current = Some(CurrentModel {
            name: name.to_string(),
            handle: Arc::clone(&handle),
        });
        Ok(handle)
    }

    fn fail(&self, batch_id: &str, index: usize, source: RenderError) -> RunnerError {
        self.tracker.error(batch_id, source.to_string());
        RunnerError::Cell { index, source }
    }
}
