use crate::config::{PipelineConfig, ValidationLevel};
use crate::error::{Result, RichnessError};
use crate::season::SeasonFilter;
use crate::species::SpeciesCode;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "richness")]
#[command(about = "Build a species richness raster from GAP habitat models")]
#[command(version)]
#[command(author = "GAP Analysis Project")]
pub struct Args {
    /// JSON configuration file; other options override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Group name used for output files (e.g. raptors)
    #[arg(short, long, value_name = "NAME")]
    pub group: Option<String>,

    /// Directory for checkpoints, the final raster, log and species table
    #[arg(short, long, value_name = "DIR")]
    pub output_root: Option<PathBuf>,

    /// Directory holding one habitat raster per species code
    #[arg(short, long, value_name = "DIR")]
    pub source_root: Option<PathBuf>,

    /// Directory for scratch workspaces (default: output root)
    #[arg(long, value_name = "DIR")]
    pub scratch_root: Option<PathBuf>,

    /// Species per batch (default: 20)
    #[arg(short, long, value_name = "N")]
    pub interval: Option<usize>,

    /// Summer, Winter or Year-round (default: Year-round)
    #[arg(long, value_name = "SEASON")]
    pub season: Option<SeasonFilter>,

    /// CSV of species metadata for the species table
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Checkpoint validation: off, warn or fail
    #[arg(long, value_name = "LEVEL")]
    pub validate: Option<ValidationLevel>,

    /// Raster whose extent every sum covers; its valid cells count species
    #[arg(long, value_name = "FILE")]
    pub extent_reference: Option<PathBuf>,

    /// Reuse checkpoints recorded in the run log
    #[arg(long)]
    pub resume: bool,

    /// Delete intermediate checkpoints after the final merge
    #[arg(long)]
    pub discard_checkpoints: bool,

    /// Species codes, comma separated
    #[arg(long, value_name = "CODES", value_delimiter = ',')]
    pub species: Vec<String>,

    /// File with one species code per line ('#' starts a comment)
    #[arg(long, value_name = "FILE")]
    pub species_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Build the run configuration from `--config` and the overriding options.
    pub fn to_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => {
                let group = self.group.clone().ok_or_else(|| {
                    RichnessError::InvalidConfig("--group is required without --config".to_string())
                })?;
                let output_root = self.output_root.clone().ok_or_else(|| {
                    RichnessError::InvalidConfig("--output-root is required without --config".to_string())
                })?;
                PipelineConfig::new(group, output_root)
            }
        };

        if let Some(group) = &self.group {
            config.group_name = group.clone();
        }
        if let Some(root) = &self.output_root {
            config.output_root = root.clone();
        }
        if let Some(root) = &self.source_root {
            config.source_root = Some(root.clone());
        }
        if let Some(root) = &self.scratch_root {
            config.scratch_root = Some(root.clone());
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(season) = self.season {
            config.season = season;
        }
        if let Some(catalog) = &self.catalog {
            config.catalog_path = Some(catalog.clone());
        }
        if let Some(level) = self.validate {
            config.validation.level = level;
        }
        if let Some(extent) = &self.extent_reference {
            config.validation.extent_reference = Some(extent.clone());
        }
        if self.resume {
            config.resume = true;
        }
        if self.discard_checkpoints {
            config.keep_checkpoints = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Species from `--species` followed by those in `--species-file`.
    pub fn species_list(&self) -> Result<Vec<SpeciesCode>> {
        let mut species: Vec<SpeciesCode> = self
            .species
            .iter()
            .filter(|code| !code.trim().is_empty())
            .map(|code| SpeciesCode::new(code.as_str()))
            .collect();

        if let Some(path) = &self.species_file {
            let contents = std::fs::read_to_string(path)?;
            species.extend(parse_species_lines(&contents));
        }
        Ok(species)
    }
}

fn parse_species_lines(contents: &str) -> impl Iterator<Item = SpeciesCode> + '_ {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(SpeciesCode::from)
}
