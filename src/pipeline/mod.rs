//! Batch ingestion: discover the files of a data folder, parse them in
//! parallel, reconcile against the stored records, persist, then compute and
//! cache metrics.
//!
//! Layout of a data folder:
//!
//! ```text
//! data/
//!   Portefeuille LPB 20250529.xlsx        -> platform from the file name
//!   Portefeuille BienPreter 20250529.xlsx
//!   pea/
//!     releve_2024.pdf                     -> PEA transactions
//!     evaluation_2024-03-31.pdf           -> PEA valuation
//! ```

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::adapters::{adapter_for, workbook, AdapterOutput, ParseContext, RawTables};
use crate::config::IngestConfig;
use crate::errors::{IngestError, Result};
use crate::metrics::{MetricsEngine, ScopeMetrics};
use crate::models::{FileCounts, FileReport, FileStatus, Issue, Platform, Severity};
use crate::normalize::fold_key;
use crate::reconcile::{DataQuality, Reconciler};
use crate::statement::{process_document, DocumentKind};
use crate::store::{MetricCache, RecordStore};

const WORKBOOK_EXTENSIONS: [&str; 4] = ["xlsx", "xlsm", "xls", "ods"];
const STATEMENT_FOLDER: &str = "pea";

// =============================================================================
// Discovery
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Workbook(Platform),
    Statement(DocumentKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SourceFile {
    pub fn name(&self) -> String {
        file_name(&self.path)
    }

    pub fn platform(&self) -> Platform {
        match self.kind {
            SourceKind::Workbook(p) => p,
            SourceKind::Statement(_) => Platform::Pea,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<SourceFile>,
    /// Candidate files that could not be routed
    pub rejected: Vec<FileReport>,
}

fn rejected(path: &Path, platform: Option<Platform>, issue: Issue) -> FileReport {
    FileReport::new(file_name(path), platform, FileCounts::default(), vec![issue])
}

fn classify(path: &Path, in_statement_folder: bool, config: &IngestConfig, found: &mut Discovery) {
    let name = file_name(path);
    let ext = extension(path);

    if WORKBOOK_EXTENSIONS.contains(&ext.as_str()) {
        match config.platform_for_file_name(&name) {
            Some(platform) => found.files.push(SourceFile { path: path.to_path_buf(), kind: SourceKind::Workbook(platform) }),
            None => found.rejected.push(rejected(
                path,
                None,
                Issue::warning("unknown_platform", format!("no platform recognized in {:?}", name)),
            )),
        }
    } else if ext == "pdf" {
        let is_pea = in_statement_folder || config.platform_for_file_name(&name) == Some(Platform::Pea);
        if !is_pea {
            log::debug!("Ignoring PDF outside the statement folder: {}", name);
            return;
        }
        match DocumentKind::from_file_name(&name) {
            Some(kind) => found.files.push(SourceFile { path: path.to_path_buf(), kind: SourceKind::Statement(kind) }),
            None => found.rejected.push(rejected(
                path,
                Some(Platform::Pea),
                Issue::warning("unknown_document", format!("{:?} is neither a statement nor a valuation", name)),
            )),
        }
    } else {
        log::debug!("Ignoring {}", name);
    }
}

/// List the files of `data_dir` (and its `pea/` folder) that can be ingested.
pub fn discover(data_dir: &Path, config: &IngestConfig) -> Result<Discovery> {
    let mut found = Discovery::default();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(data_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if fold_key(&file_name(&path)) != STATEMENT_FOLDER {
                continue;
            }
            let mut statements: Vec<PathBuf> = std::fs::read_dir(&path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            statements.sort();
            for statement in statements {
                classify(&statement, true, config, &mut found);
            }
        } else {
            classify(&path, false, config, &mut found);
        }
    }

    log::info!(
        "Discovered {} file(s) in {} ({} rejected)",
        found.files.len(),
        data_dir.display(),
        found.rejected.len()
    );
    Ok(found)
}

// =============================================================================
// Batch summary
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTotals {
    pub files: usize,
    pub succeeded: usize,
    pub warnings: usize,
    pub errors: usize,
    pub records: FileCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub user: String,
    pub as_of: NaiveDate,
    pub files: Vec<FileReport>,
    pub totals: BatchTotals,
    /// Issues raised while reconciling the batch with stored records
    pub reconcile_issues: Vec<Issue>,
    pub quality: DataQuality,
    pub new_investments: usize,
    pub new_cash_flows: usize,
    pub metrics: Vec<ScopeMetrics>,
}

fn totals(files: &[FileReport]) -> BatchTotals {
    let mut totals = BatchTotals { files: files.len(), ..Default::default() };
    for report in files {
        match report.status {
            FileStatus::Success => totals.succeeded += 1,
            FileStatus::Warning => totals.warnings += 1,
            FileStatus::Error => totals.errors += 1,
        }
        totals.records.investments += report.counts.investments;
        totals.records.cashflows += report.counts.cashflows;
        totals.records.positions += report.counts.positions;
        totals.records.liquidity += report.counts.liquidity;
        totals.records.skipped += report.counts.skipped;
    }
    totals
}

// =============================================================================
// Pipeline
// =============================================================================

/// Result of parsing one file: its report, and its records when it parsed.
pub struct ParsedFile {
    pub report: FileReport,
    pub output: Option<AdapterOutput>,
}

impl ParsedFile {
    fn parsed(file: String, platform: Platform, output: AdapterOutput) -> Self {
        let counts = FileCounts {
            investments: output.investments.len(),
            cashflows: output.cash_flows.len(),
            positions: output.positions.len(),
            liquidity: output.liquidity.len(),
            skipped: output.skipped,
        };
        let report = FileReport::new(file, Some(platform), counts, output.issues.clone());
        Self { report, output: Some(output) }
    }

    fn failed(file: String, platform: Option<Platform>, err: &IngestError) -> Self {
        log::warn!("{}: {}", file, err);
        let report = FileReport::new(file, platform, FileCounts::default(), vec![Issue::from_error(err, Severity::Error)]);
        Self { report, output: None }
    }
}

pub struct Pipeline<'a> {
    config: &'a IngestConfig,
    as_of: NaiveDate,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a IngestConfig, as_of: NaiveDate) -> Self {
        Self { config, as_of }
    }

    fn context(&self) -> ParseContext<'a> {
        ParseContext::new(self.config, self.as_of)
    }

    /// Run one workbook through its platform adapter.
    pub fn parse_tables(&self, platform: Platform, tables: &RawTables) -> ParsedFile {
        let Some(adapter) = adapter_for(platform) else {
            let err = IngestError::MissingAdapter(platform.key().to_string());
            return ParsedFile::failed(tables.source.clone(), Some(platform), &err);
        };
        match adapter.parse(tables, &self.context()) {
            Ok(output) => ParsedFile::parsed(tables.source.clone(), platform, output),
            Err(e) => ParsedFile::failed(tables.source.clone(), Some(platform), &e),
        }
    }

    fn parse_file(&self, file: &SourceFile) -> ParsedFile {
        log::info!("Parsing {}", file.path.display());
        match file.kind {
            SourceKind::Workbook(platform) => match workbook::load_workbook(&file.path) {
                Ok(tables) => self.parse_tables(platform, &tables),
                Err(e) => ParsedFile::failed(file.name(), Some(platform), &e),
            },
            SourceKind::Statement(kind) => match process_document(&file.path, kind, &self.context()) {
                Ok(output) => ParsedFile::parsed(file.name(), Platform::Pea, output.into()),
                Err(e) => ParsedFile::failed(file.name(), Some(Platform::Pea), &e),
            },
        }
    }

    /// Parse every file in parallel. A platform without an adapter fails its
    /// own files only.
    pub fn parse_files(&self, files: &[SourceFile]) -> Vec<ParsedFile> {
        let missing: BTreeSet<Platform> = files
            .iter()
            .filter_map(|f| match f.kind {
                SourceKind::Workbook(p) if adapter_for(p).is_none() => Some(p),
                _ => None,
            })
            .collect();
        for platform in &missing {
            log::warn!("No adapter for {}, skipping its workbooks", platform);
        }

        files
            .par_iter()
            .map(|file| match file.kind {
                SourceKind::Workbook(p) if missing.contains(&p) => {
                    ParsedFile::failed(file.name(), Some(p), &IngestError::MissingAdapter(p.key().to_string()))
                }
                _ => self.parse_file(file),
            })
            .collect()
    }

    /// Reconcile parsed files with the stored records of `user`, persist the
    /// result and refresh the metric cache.
    pub fn finish<S>(&self, user: &str, parsed: Vec<ParsedFile>, mut reports: Vec<FileReport>, store: &mut S) -> Result<BatchSummary>
    where
        S: RecordStore + MetricCache,
    {
        let mut outputs = Vec::new();
        for file in parsed {
            reports.push(file.report);
            outputs.extend(file.output);
        }

        let existing = store.load_dataset(user)?;
        let outcome = Reconciler::new(self.config, self.as_of).reconcile(existing, outputs);
        store.save_dataset(user, &outcome.dataset)?;

        let metrics = MetricsEngine::new(&self.config.metrics, self.as_of).compute_all(&outcome.dataset);
        for scope in &metrics {
            store.store_metrics(user, scope.scope, &scope.metrics)?;
        }

        let totals = totals(&reports);
        log::info!(
            "Batch for {}: {} file(s), {} ok, {} with warnings, {} failed",
            user,
            totals.files,
            totals.succeeded,
            totals.warnings,
            totals.errors
        );

        Ok(BatchSummary {
            user: user.to_string(),
            as_of: self.as_of,
            files: reports,
            totals,
            reconcile_issues: outcome.issues,
            quality: outcome.quality,
            new_investments: outcome.new_investments,
            new_cash_flows: outcome.new_cash_flows,
            metrics,
        })
    }

    /// Discover, parse, reconcile, persist and compute for one data folder.
    pub fn run<S>(&self, data_dir: &Path, user: &str, store: &mut S) -> Result<BatchSummary>
    where
        S: RecordStore + MetricCache,
    {
        let discovery = discover(data_dir, self.config)?;
        let parsed = self.parse_files(&discovery.files);
        self.finish(user, parsed, discovery.rejected, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Sheet;
    use crate::metrics::{MetricType, Scope};
    use crate::models::{FlowType, InvestmentStatus};
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sheet(name: &str, rows: &[&[&str]]) -> Sheet {
        Sheet::new(name, rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect())
    }

    fn bienpreter_workbook() -> RawTables {
        bienpreter_workbook_with(&["Remboursement", "BP-001", "Extension atelier", "15/07/2023", "350", "0", "", "500", "150"])
    }

    fn bienpreter_workbook_with(account_row: &[&str]) -> RawTables {
        RawTables::new(
            "Portefeuille BienPreter.xlsx",
            vec![
                sheet(
                    "Projets",
                    &[
                        &["N° contrat", "Projet", "Société", "Montant", "Taux", "Durée", "Date", "Fin", "", "", "Statut"],
                        &["BP-001", "Extension atelier", "Menuiserie Martin", "10 000", "9,5", "36", "15/01/2023", "15/01/2026", "", "", "En cours"],
                    ],
                ),
                sheet(
                    "Relevé compte",
                    &[
                        &["Opération", "N° contrat", "Projet", "Date", "Montant net", "Capital", "", "Intérêts bruts", "Prélèvements"],
                        account_row,
                    ],
                ),
            ],
        )
    }

    #[test]
    fn test_discovery_routes_by_name_and_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("pea")).unwrap();
        for name in ["Portefeuille LPB 20250529.xlsx", "Portefeuille PretUp.xlsx", "budget.xlsx", "notes.txt", "facture.pdf"] {
            std::fs::write(root.join(name), b"x").unwrap();
        }
        for name in ["releve_2024.pdf", "evaluation_2024-03-31.pdf", "notice.pdf"] {
            std::fs::write(root.join("pea").join(name), b"x").unwrap();
        }

        let found = discover(root, &IngestConfig::default()).unwrap();
        let kinds: Vec<SourceKind> = found.files.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SourceKind::Workbook(Platform::Lpb),
                SourceKind::Workbook(Platform::PretUp),
                SourceKind::Statement(DocumentKind::Valuation),
                SourceKind::Statement(DocumentKind::Transactions),
            ]
        );
        let codes: Vec<&str> = found.rejected.iter().map(|r| r.issues[0].code.as_str()).collect();
        assert_eq!(codes, vec!["unknown_platform", "unknown_document"]);
    }

    #[test]
    fn test_broken_files_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("pea")).unwrap();
        std::fs::write(root.join("Portefeuille LPB.xlsx"), b"not a workbook").unwrap();
        std::fs::write(root.join("pea").join("releve.pdf"), b"not a pdf").unwrap();

        let config = IngestConfig::default();
        let mut store = MemoryStore::new();
        let summary = Pipeline::new(&config, date(2024, 1, 1)).run(root, "alice", &mut store).unwrap();

        assert_eq!(summary.totals.files, 2);
        assert_eq!(summary.totals.errors, 2);
        let pdf = summary.files.iter().find(|r| r.file == "releve.pdf").unwrap();
        assert_eq!(pdf.issues[0].code, "document_unreadable");
        // the global scope is still computed, with explicit markers
        assert_eq!(summary.metrics.len(), 1);
        assert_eq!(summary.metrics[0].scope, Scope::Global);
    }

    #[test]
    fn test_missing_adapter_fails_only_its_platform() {
        let config = IngestConfig::default();
        let pipeline = Pipeline::new(&config, date(2024, 1, 1));
        let tables = RawTables::new("Portefeuille PEA.xlsx", vec![]);
        let parsed = pipeline.parse_tables(Platform::Pea, &tables);
        assert_eq!(parsed.report.status, FileStatus::Error);
        assert_eq!(parsed.report.issues[0].code, "missing_adapter");
        assert!(parsed.output.is_none());

        let ok = pipeline.parse_tables(Platform::BienPreter, &bienpreter_workbook());
        assert_eq!(ok.report.status, FileStatus::Success);
    }

    #[test]
    fn test_end_to_end_interest_only_repayment() {
        let config = IngestConfig::default();
        let pipeline = Pipeline::new(&config, date(2024, 1, 1));
        let mut store = MemoryStore::new();

        for _ in 0..2 {
            let parsed = vec![pipeline.parse_tables(Platform::BienPreter, &bienpreter_workbook())];
            pipeline.finish("alice", parsed, vec![], &mut store).unwrap();
        }

        let data = store.load_dataset("alice").unwrap();
        assert_eq!(data.investments.len(), 1);
        assert_eq!(data.cash_flows.len(), 1);

        let inv = &data.investments[0];
        assert_eq!(inv.remaining_capital, dec!(10000));
        assert_eq!(inv.status, InvestmentStatus::Active);

        let flow = &data.cash_flows[0];
        assert_eq!(flow.flow_type, FlowType::Repayment);
        assert_eq!(flow.investment_id, Some(inv.id));
        assert_eq!(flow.capital_amount, Decimal::ZERO);
        assert_eq!(flow.interest_amount, dec!(500));
        assert_eq!(flow.tax_amount, dec!(150));

        let cached = store.cached_metrics("alice", Scope::Platform(Platform::BienPreter)).unwrap();
        let invested = cached.iter().find(|m| m.metric_type == MetricType::TotalInvested).unwrap();
        assert_eq!(invested.value.as_f64(), Some(10000.0));
    }
    #[test]
    fn test_flagged_flow_is_stored_once() {
        // net 400 does not match gross 600 minus tax 150
        let tables = bienpreter_workbook_with(&["Remboursement", "BP-001", "Extension atelier", "15/07/2023", "400", "100", "", "500", "150"]);
        let config = IngestConfig::default();
        let pipeline = Pipeline::new(&config, date(2024, 1, 1));
        let mut store = MemoryStore::new();

        let parsed = vec![pipeline.parse_tables(Platform::BienPreter, &tables)];
        let first = pipeline.finish("alice", parsed, vec![], &mut store).unwrap();
        assert_eq!(first.files[0].status, FileStatus::Warning);
        assert_eq!(first.new_cash_flows, 1);
        assert_eq!(first.quality.tax_inconsistencies, 1);
        assert_eq!(store.load_dataset("alice").unwrap().cash_flows.len(), 1);

        let parsed = vec![pipeline.parse_tables(Platform::BienPreter, &tables)];
        let second = pipeline.finish("alice", parsed, vec![], &mut store).unwrap();
        assert_eq!(second.new_cash_flows, 0);
        let stored = store.load_dataset("alice").unwrap();
        assert_eq!(stored.cash_flows.len(), 1);
        assert_eq!(stored.cash_flows[0].net_amount, dec!(400));
        assert_eq!(stored.investments[0].capital_repaid, dec!(100));
    }
}
