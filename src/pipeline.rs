//! The run driver: partition, then stage, reclassify and sum each batch, then
//! merge the checkpoints into the final richness raster.

use crate::accumulate::accumulate_batch;
use crate::config::{PipelineConfig, ValidationLevel};
use crate::error::{ExclusionKind, Result, RichnessError, SpeciesError};
use crate::io::{GeoTiffBackend, RasterBackend};
use crate::layout::RunLayout;
use crate::manifest::{BatchParameters, LogEvent, ManifestReplay, RunLog};
use crate::merge::merge_checkpoints;
use crate::partition::{Batch, BatchPlan};
use crate::raster::Raster;
use crate::reclass::reclassify;
use crate::species::{write_species_table, CsvSpeciesCatalog, SpeciesCatalog, SpeciesCode};
use crate::stage::{stage_species, DirectoryHabitatSource, HabitatSource};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

/// A species left out of the richness raster.
#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedSpecies {
    pub species: SpeciesCode,
    /// Batch the species belonged to, e.g. `raptors_20`
    pub batch: String,
    pub kind: ExclusionKind,
    pub message: String,
}

/// A sum whose maximum disagrees with the number of species it should count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationMismatch {
    pub batch: String,
    pub expected: usize,
    pub observed: Option<u16>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub final_raster: PathBuf,
    pub species_table: PathBuf,
    /// Checkpoints left on disk (empty when they were discarded)
    pub checkpoints: Vec<PathBuf>,
    pub included: Vec<SpeciesCode>,
    pub excluded: Vec<ExcludedSpecies>,
    pub mismatches: Vec<ValidationMismatch>,
    pub max_richness: Option<u16>,
}

impl RunReport {
    /// No validation mismatches were recorded.
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct RichnessPipeline<B: RasterBackend = GeoTiffBackend> {
    config: PipelineConfig,
    layout: RunLayout,
    backend: B,
    source: Box<dyn HabitatSource>,
    catalog: Box<dyn SpeciesCatalog>,
}

impl RichnessPipeline<GeoTiffBackend> {
    /// GeoTIFF backend, habitat rasters from `source_root`, and the species
    /// catalog from `catalog_path` when one is configured.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let source_root = config.source_root.clone().ok_or_else(|| {
            RichnessError::InvalidConfig("source_root is required".to_string())
        })?;
        let catalog = match &config.catalog_path {
            Some(path) => CsvSpeciesCatalog::from_path(path)?,
            None => CsvSpeciesCatalog::empty(),
        };
        Ok(Self::new(
            config,
            GeoTiffBackend::new(),
            Box::new(DirectoryHabitatSource::new(source_root)),
            Box::new(catalog),
        ))
    }
}

impl<B: RasterBackend> RichnessPipeline<B> {
    pub fn new(
        config: PipelineConfig,
        backend: B,
        source: Box<dyn HabitatSource>,
        catalog: Box<dyn SpeciesCatalog>,
    ) -> Self {
        let layout = RunLayout::from_config(&config);
        Self {
            config,
            layout,
            backend,
            source,
            catalog,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Settings a reused checkpoint must have been built with.
    pub fn batch_parameters(&self) -> BatchParameters {
        BatchParameters {
            season: self.config.season,
            season_codes: self.config.season_codes,
            extent_reference: self.config.validation.extent_reference.clone(),
        }
    }

    /// Build the richness raster for `species`.
    ///
    /// Species that cannot be processed are excluded and reported; any
    /// other failure aborts the run. The scratch workspace is removed
    /// either way.
    pub fn run(&self, species: &[SpeciesCode]) -> Result<RunReport> {
        self.config.validate()?;
        reject_duplicates(species)?;

        let layout = &self.layout;
        layout.prepare()?;
        let workspace = WorkspaceGuard::new(layout);

        let replay = if self.config.resume {
            RunLog::replay(&layout.log_path())?
        } else {
            ManifestReplay::default()
        };
        let extent = self
            .config
            .validation
            .extent_reference
            .as_deref()
            .map(|path| self.backend.read(path))
            .transpose()?;
        let params = self.batch_parameters();

        let mut state = RunState {
            log: RunLog::open(&layout.log_path())?,
            included: Vec::new(),
            excluded: Vec::new(),
            mismatches: Vec::new(),
            checkpoints: Vec::new(),
        };

        info!("Richness for {} ({} species)", layout.group(), species.len());
        state.log.record(LogEvent::RunStarted {
            group: layout.group().to_string(),
            species_count: species.len(),
            interval: self.config.interval,
            season: self.config.season,
        })?;

        let plan = BatchPlan::new(species, self.config.interval)?;
        for batch in plan.iter() {
            let members: Vec<String> = batch.members.iter().map(|s| s.to_string()).collect();
            match replay.completed(batch.offset) {
                Some(done) if done.is_reusable_for(&members, &params) => {
                    self.resume_batch(&mut state, &batch, done.checkpoint.clone(), &done.included)?;
                }
                Some(_) => {
                    info!(
                        "Batch {} was summed with different members or settings, redoing it",
                        layout.batch_name(batch.offset)
                    );
                    self.process_batch(&mut state, &batch, members, extent.as_ref(), &params)?
                }
                None => self.process_batch(&mut state, &batch, members, extent.as_ref(), &params)?,
            }
            layout.clear_batch_workspace()?;
        }

        if state.included.is_empty() {
            return Err(RichnessError::NothingToMerge);
        }

        let final_raster = layout.final_raster();
        let merged = merge_checkpoints(
            &self.backend,
            &state.checkpoints,
            extent.as_ref().map(|reference| &reference.metadata),
            &final_raster,
        )?;
        state.log.record(LogEvent::MergeCompleted {
            path: merged.path.clone(),
            species_count: state.included.len(),
            max_value: merged.max_value,
        })?;

        let observed = merged.max_value.map_or(0, usize::from);
        if let Some(mismatch) =
            final_bound_mismatch(layout.group(), merged.max_value, state.included.len())
        {
            state.mismatch(&mismatch)?;
            if self.config.validation.level == ValidationLevel::Fail {
                return Err(mismatch.into());
            }
        }

        let species_table = layout.table_path();
        write_species_table(&species_table, &state.included, self.catalog.as_ref())?;
        state.log.record(LogEvent::SpeciesTableWritten {
            path: species_table.clone(),
        })?;

        workspace.release()?;

        if !self.config.keep_checkpoints {
            self.discard_checkpoints(&mut state.checkpoints);
        }

        state.log.record(LogEvent::RunCompleted {
            included: state.included.len(),
            excluded: state.excluded.len(),
            mismatches: state.mismatches.len(),
        })?;
        info!(
            "Richness complete: {} species included, {} excluded, max richness {}",
            state.included.len(),
            state.excluded.len(),
            observed
        );

        Ok(RunReport {
            final_raster,
            species_table,
            checkpoints: state.checkpoints,
            included: state.included,
            excluded: state.excluded,
            mismatches: state.mismatches,
            max_richness: merged.max_value,
        })
    }

    fn process_batch(
        &self,
        state: &mut RunState,
        batch: &Batch<'_, SpeciesCode>,
        members: Vec<String>,
        extent: Option<&Raster>,
        params: &BatchParameters,
    ) -> Result<()> {
        let layout = &self.layout;
        let name = layout.batch_name(batch.offset);
        info!("Batch {} ({} species): copying rasters", name, batch.len());
        state.log.record(LogEvent::BatchStarted {
            batch: name.clone(),
            offset: batch.offset,
            members: members.clone(),
        })?;

        let mut masks = Vec::with_capacity(batch.len());
        for species in batch.members {
            let staged = match stage_species(&self.backend, self.source.as_ref(), species, &layout.scratch_dir())? {
                Ok(staged) => staged,
                Err(err) => {
                    state.exclude(&name, err)?;
                    continue;
                }
            };
            state.log.record(LogEvent::SpeciesStaged {
                batch: name.clone(),
                species: species.to_string(),
            })?;

            match reclassify(
                &self.backend,
                &staged,
                self.config.season,
                &self.config.season_codes,
                &layout.reclass_dir(),
            )? {
                Ok(mask) => {
                    state.log.record(LogEvent::SpeciesReclassified {
                        batch: name.clone(),
                        species: species.to_string(),
                        present_cells: mask.present_cells,
                    })?;
                    masks.push(mask);
                }
                Err(err) => state.exclude(&name, err)?,
            }
        }
        info!("\tReclassified {} of {} rasters", masks.len(), batch.len());

        let checkpoint_path = layout.checkpoint_path(batch.offset);
        let (sum, rejected) = accumulate_batch(&self.backend, &masks, extent, &checkpoint_path)?;
        for err in rejected {
            state.exclude(&name, err)?;
        }

        let Some(sum) = sum else {
            warn!("Batch {} has no species to sum", name);
            return state.log.record(LogEvent::BatchEmpty {
                batch: name,
                offset: batch.offset,
                members,
                params: params.clone(),
            });
        };

        // The counting cells hold one per folded mask, so a shortfall means
        // a mask handed to the sum never made it in
        if self.config.validation.level != ValidationLevel::Off {
            let expected = masks.len();
            if sum.max_value.map(usize::from) != Some(expected) {
                let mismatch = ValidationMismatch {
                    batch: name.clone(),
                    expected,
                    observed: sum.max_value,
                };
                state.mismatch(&mismatch)?;
                if self.config.validation.level == ValidationLevel::Fail {
                    return Err(mismatch.into());
                }
            }
        }

        let included: Vec<String> = sum.folded.iter().map(|s| s.to_string()).collect();
        state.log.record(LogEvent::CheckpointWritten {
            batch: name,
            offset: batch.offset,
            path: sum.checkpoint.clone(),
            members,
            included,
            max_value: sum.max_value,
            params: params.clone(),
        })?;
        state.checkpoints.push(sum.checkpoint);
        state.included.extend(sum.folded);
        Ok(())
    }

    /// Reuse a batch an earlier run already summed.
    fn resume_batch(
        &self,
        state: &mut RunState,
        batch: &Batch<'_, SpeciesCode>,
        checkpoint: Option<PathBuf>,
        included: &[String],
    ) -> Result<()> {
        let name = self.layout.batch_name(batch.offset);
        info!("Batch {} already summed, reusing it", name);
        state.log.record(LogEvent::BatchResumed {
            batch: name.clone(),
            offset: batch.offset,
            path: checkpoint.clone(),
        })?;

        let kept: HashSet<String> = included
            .iter()
            .map(|code| SpeciesCode::new(code.as_str()).normalized())
            .collect();
        for species in batch.members {
            if kept.contains(&species.normalized()) {
                state.included.push(species.clone());
            } else {
                state.excluded.push(ExcludedSpecies {
                    species: species.clone(),
                    batch: name.clone(),
                    kind: ExclusionKind::EarlierRun,
                    message: format!("{} was excluded when {} was first summed", species, name),
                });
            }
        }
        state.checkpoints.extend(checkpoint);
        Ok(())
    }

    fn discard_checkpoints(&self, checkpoints: &mut Vec<PathBuf>) {
        for path in checkpoints.drain(..) {
            if let Err(e) = self.backend.delete(&path) {
                warn!("Could not delete checkpoint {}: {}", path.display(), e);
            }
        }
        // Only removes the directory when nothing else lives there
        if fs::remove_dir(self.layout.intermediate_dir()).is_err() {
            debug!(
                "Leaving {} in place",
                self.layout.intermediate_dir().display()
            );
        }
    }
}

struct RunState {
    log: RunLog,
    included: Vec<SpeciesCode>,
    excluded: Vec<ExcludedSpecies>,
    mismatches: Vec<ValidationMismatch>,
    checkpoints: Vec<PathBuf>,
}

impl RunState {
    fn exclude(&mut self, batch: &str, err: SpeciesError) -> Result<()> {
        warn!("\t{}", err);
        let message = err.to_string();
        self.log.record(LogEvent::SpeciesExcluded {
            batch: batch.to_string(),
            species: err.species().to_string(),
            reason: err.kind(),
            message: message.clone(),
        })?;
        self.excluded.push(ExcludedSpecies {
            species: SpeciesCode::new(err.species()),
            batch: batch.to_string(),
            kind: err.kind(),
            message,
        });
        Ok(())
    }

    fn mismatch(&mut self, mismatch: &ValidationMismatch) -> Result<()> {
        warn!(
            "{}: max richness {:?} does not match {} species",
            mismatch.batch, mismatch.observed, mismatch.expected
        );
        self.log.record(LogEvent::ValidationMismatch {
            batch: mismatch.batch.clone(),
            expected: mismatch.expected,
            observed: mismatch.observed,
        })?;
        self.mismatches.push(mismatch.clone());
        Ok(())
    }
}

impl From<ValidationMismatch> for RichnessError {
    fn from(mismatch: ValidationMismatch) -> Self {
        RichnessError::ValidationFailed {
            batch: mismatch.batch,
            expected: mismatch.expected,
            observed: mismatch.observed,
        }
    }
}

/// No cell of the final raster can count more species than were included.
fn final_bound_mismatch(
    group: &str,
    max_value: Option<u16>,
    included: usize,
) -> Option<ValidationMismatch> {
    let observed = max_value.map_or(0, usize::from);
    (observed > included).then(|| ValidationMismatch {
        batch: group.to_string(),
        expected: included,
        observed: max_value,
    })
}

fn reject_duplicates(species: &[SpeciesCode]) -> Result<()> {
    let mut seen = HashSet::with_capacity(species.len());
    for code in species {
        if !seen.insert(code.normalized()) {
            return Err(RichnessError::DuplicateSpecies(code.to_string()));
        }
    }
    Ok(())
}

/// Removes the scratch and reclassed directories when the run ends, however
/// it ends.
struct WorkspaceGuard<'a> {
    layout: &'a RunLayout,
    armed: bool,
}

impl<'a> WorkspaceGuard<'a> {
    fn new(layout: &'a RunLayout) -> Self {
        Self { layout, armed: true }
    }

    fn release(mut self) -> std::io::Result<()> {
        self.armed = false;
        self.layout.remove_workspace()
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.layout.remove_workspace() {
                warn!("Could not remove scratch workspace: {}", e);
            }
        }
    }
}
