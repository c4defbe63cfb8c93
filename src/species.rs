//! Species codes, the metadata catalog, and the species-inclusion table.

use crate::error::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// A GAP species code (e.g. `bBAEAx`). Capitalization is irrelevant for
/// lookups; the normalized form is lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeciesCode(String);

impl SpeciesCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for SpeciesCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeciesCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for SpeciesCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

/// Taxonomy and crosswalk information for one species. Field names follow
/// the GAP species table headings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    #[serde(rename = "GAPCode")]
    pub gap_code: String,
    #[serde(rename = "Class", default)]
    pub class: String,
    #[serde(rename = "Order", default)]
    pub order: String,
    #[serde(rename = "Family", default)]
    pub family: String,
    #[serde(rename = "Genus", default)]
    pub genus: String,
    #[serde(rename = "Species", default)]
    pub species: String,
    #[serde(rename = "Subspecies", default)]
    pub subspecies: String,
    #[serde(rename = "Binomial", default)]
    pub binomial: String,
    #[serde(rename = "CommonName", default)]
    pub common_name: String,
    #[serde(rename = "ELCODE", default)]
    pub elcode: String,
    #[serde(rename = "ITS_TSN", default)]
    pub itis_tsn: String,
    #[serde(rename = "NatureServeID", default)]
    pub natureserve_id: String,
    #[serde(rename = "Published_Range", default)]
    pub published_range: String,
    #[serde(rename = "Published_Model", default)]
    pub published_model: String,
    #[serde(rename = "GAP_National_Download", default)]
    pub national_download: String,
}

impl SpeciesRecord {
    /// Row for a species the catalog knows nothing about.
    pub fn code_only(species: &SpeciesCode) -> Self {
        Self {
            gap_code: species.to_string(),
            ..Self::default()
        }
    }
}

/// Read-only species metadata lookup.
pub trait SpeciesCatalog {
    fn lookup(&self, species: &SpeciesCode) -> Option<SpeciesRecord>;
}

/// Catalog loaded from a CSV with the species table headings.
#[derive(Debug, Clone, Default)]
pub struct CsvSpeciesCatalog {
    records: HashMap<String, SpeciesRecord>,
}

impl CsvSpeciesCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading species catalog: {}", path.display());
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let mut records = HashMap::new();
        for row in reader.deserialize() {
            let record: SpeciesRecord = row?;
            let key = record.gap_code.to_lowercase();
            if records.insert(key.clone(), record).is_some() {
                warn!("Species catalog lists {} more than once; keeping the last row", key);
            }
        }

        debug!("Species catalog holds {} records", records.len());
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<SpeciesRecord> for CsvSpeciesCatalog {
    fn from_iter<I: IntoIterator<Item = SpeciesRecord>>(iter: I) -> Self {
        let records = iter
            .into_iter()
            .map(|record| (record.gap_code.to_lowercase(), record))
            .collect();
        Self { records }
    }
}

impl SpeciesCatalog for CsvSpeciesCatalog {
    fn lookup(&self, species: &SpeciesCode) -> Option<SpeciesRecord> {
        self.records.get(&species.normalized()).cloned()
    }
}

/// Column headings of the species table, in order.
pub const TABLE_HEADINGS: [&str; 15] = [
    "GAPCode",
    "Class",
    "Order",
    "Family",
    "Genus",
    "Species",
    "Subspecies",
    "Binomial",
    "CommonName",
    "ELCODE",
    "ITS_TSN",
    "NatureServeID",
    "Published_Range",
    "Published_Model",
    "GAP_National_Download",
];

/// Write one row per included species. Species missing from the catalog
/// still get a row carrying only their code.
pub fn write_species_table(
    path: &Path,
    included: &[SpeciesCode],
    catalog: &dyn SpeciesCatalog,
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(TABLE_HEADINGS)?;

    for species in included {
        let record = catalog.lookup(species).unwrap_or_else(|| {
            debug!("No catalog entry for {}", species);
            SpeciesRecord::code_only(species)
        });
        writer.serialize(&record)?;
    }
    writer.flush()?;

    info!("Species table written to {} ({} species)", path.display(), included.len());
    Ok(())
}
