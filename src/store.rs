//! Normalized store: the single owner of all persisted pipeline state.
//!
//! Each collection is a sled tree named by its configured table identifier.
//! Row keys are key parts joined by [`KEY_SEPARATOR`], so the rows of one
//! partition (e.g. one conformance pack) share a scannable prefix. Values are
//! camelCase JSON, sealed by the [`StoreCipher`] when a key is configured.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, Transactional};
use sled::{Batch, Db, Tree};
use tracing::debug;

use crate::audit::{snapshot_digest, CommitAudit};
use crate::config::{PipelineConfig, TableNames};
use crate::delivery::DeadLetter;
use crate::errors::{PipelineError, PipelineResult};
use crate::records::{
    ComplianceDetail, ComplianceSummary, GuidanceMapping, QuestionnaireAnswer, QuestionnaireRisk,
    RemediationBacklog,
};
use crate::store_cipher::StoreCipher;

pub const KEY_SEPARATOR: u8 = 0x1F;

/// Encode key parts into a row key. Parts may not contain the separator.
pub fn row_key(parts: &[&str]) -> PipelineResult<Vec<u8>> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if part.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(PipelineError::malformed(
                "key",
                format!("'{}' contains the reserved unit separator", part.escape_debug()),
            ));
        }
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.extend_from_slice(part.as_bytes());
    }
    Ok(key)
}

fn partition_prefix(partition: &str) -> PipelineResult<Vec<u8>> {
    let mut prefix = row_key(&[partition])?;
    prefix.push(KEY_SEPARATOR);
    Ok(prefix)
}

/// What a reconciling commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub upserted: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.upserted > 0 || self.removed > 0
    }
}

pub struct NormalizedStore {
    db: Db,
    cipher: StoreCipher,
    tables: TableNames,
    summary: Tree,
    detail: Tree,
    guidance: Tree,
    backlog: Tree,
    answers: Tree,
    risks: Tree,
    dead_letters: Tree,
}

impl NormalizedStore {
    /// Open the store described by `config`, decoding its encryption key.
    pub fn open(config: &PipelineConfig) -> PipelineResult<Self> {
        let cipher = StoreCipher::from_config(config.encryption_key_b64.as_deref())?;
        Self::open_path(Path::new(&config.data_dir), &config.tables, cipher)
    }

    pub fn open_path(path: &Path, tables: &TableNames, cipher: StoreCipher) -> PipelineResult<Self> {
        let db = sled::open(path).map_err(|e| PipelineError::store("open database", e))?;
        Self::from_db(db, tables, cipher)
    }

    /// In-memory database removed on drop.
    pub fn temporary(tables: &TableNames, cipher: StoreCipher) -> PipelineResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| PipelineError::store("open temporary database", e))?;
        Self::from_db(db, tables, cipher)
    }

    fn from_db(db: Db, tables: &TableNames, cipher: StoreCipher) -> PipelineResult<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| PipelineError::store(format!("open tree {name}"), e))
        };
        Ok(Self {
            summary: open(&tables.compliance_summary)?,
            detail: open(&tables.compliance_detail)?,
            guidance: open(&tables.guidance_mapping)?,
            backlog: open(&tables.remediation_backlog)?,
            answers: open(&tables.questionnaire_answer)?,
            risks: open(&tables.questionnaire_risk)?,
            dead_letters: open(&tables.dead_letter)?,
            tables: tables.clone(),
            cipher,
            db,
        })
    }

    pub fn flush(&self) -> PipelineResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| PipelineError::store("flush", e))
    }

    fn encode<T: Serialize>(&self, context: &str, value: &T) -> PipelineResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| PipelineError::serialization(context, e))
    }

    fn decode<T: DeserializeOwned>(&self, context: &str, sealed: &[u8]) -> PipelineResult<T> {
        let plain = self.cipher.open(sealed)?;
        serde_json::from_slice(&plain).map_err(|e| PipelineError::serialization(context, e))
    }

    fn put_row<T: Serialize>(&self, tree: &Tree, name: &str, key: &[u8], value: &T) -> PipelineResult<()> {
        let sealed = self.cipher.seal(&self.encode(name, value)?)?;
        tree.insert(key, sealed)
            .map_err(|e| PipelineError::store(format!("write {name}"), e))?;
        Self::flush_tree(tree, name)
    }

    fn get_row<T: DeserializeOwned>(&self, tree: &Tree, name: &str, key: &[u8]) -> PipelineResult<Option<T>> {
        match tree
            .get(key)
            .map_err(|e| PipelineError::store(format!("read {name}"), e))?
        {
            Some(bytes) => Ok(Some(self.decode(name, &bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_rows<T: DeserializeOwned>(&self, tree: &Tree, name: &str, prefix: &[u8]) -> PipelineResult<Vec<T>> {
        tree.scan_prefix(prefix)
            .map(|item| {
                let (_, value) = item.map_err(|e| PipelineError::store(format!("scan {name}"), e))?;
                self.decode(name, &value)
            })
            .collect()
    }

    /// Plan the batch that makes the rows under `prefix` exactly `desired`.
    ///
    /// Rows whose plaintext is unchanged stay out of the batch, so re-running
    /// with the same snapshot writes nothing.
    fn plan_partition(
        &self,
        tree: &Tree,
        name: &str,
        prefix: &[u8],
        desired: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> PipelineResult<(Batch, ReconcileOutcome)> {
        let mut existing: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for item in tree.scan_prefix(prefix) {
            let (key, value) = item.map_err(|e| PipelineError::store(format!("scan {name}"), e))?;
            // Rows that no longer open under the current key are rewritten.
            existing.insert(key.to_vec(), self.cipher.open(&value).ok());
        }

        let mut batch = Batch::default();
        let mut outcome = ReconcileOutcome::default();

        for (key, plain) in desired {
            match existing.get(key) {
                Some(Some(current)) if current == plain => outcome.unchanged += 1,
                _ => {
                    batch.insert(key.as_slice(), self.cipher.seal(plain)?);
                    outcome.upserted += 1;
                }
            }
        }
        for key in existing.keys() {
            if !desired.contains_key(key) {
                batch.remove(key.as_slice());
                outcome.removed += 1;
            }
        }
        Ok((batch, outcome))
    }

    fn audit_partition(name: &str, partition: &str, outcome: &ReconcileOutcome, desired: &BTreeMap<Vec<u8>, Vec<u8>>) {
        let digest = snapshot_digest(desired.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
        CommitAudit::new(name, partition)
            .with_counts(outcome.upserted, outcome.removed)
            .with_digest(digest)
            .emit();
    }

    fn flush_tree(tree: &Tree, name: &str) -> PipelineResult<()> {
        tree.flush()
            .map(|_| ())
            .map_err(|e| PipelineError::store(format!("flush {name}"), e))
    }

    /// Make the rows under `prefix` exactly `desired`, in one atomic batch.
    fn reconcile_partition(
        &self,
        tree: &Tree,
        name: &str,
        partition: &str,
        prefix: &[u8],
        desired: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> PipelineResult<ReconcileOutcome> {
        let (batch, outcome) = self.plan_partition(tree, name, prefix, &desired)?;
        if outcome.changed() {
            tree.apply_batch(batch)
                .map_err(|e| PipelineError::store(format!("commit {name}"), e))?;
            Self::flush_tree(tree, name)?;
        }
        Self::audit_partition(name, partition, &outcome, &desired);
        Ok(outcome)
    }

    // --- compliance summary and detail ---

    pub fn summary(&self, pack_name: &str) -> PipelineResult<Option<ComplianceSummary>> {
        let key = row_key(&[pack_name])?;
        self.get_row(&self.summary, &self.tables.compliance_summary, &key)
    }

    pub fn summaries(&self) -> PipelineResult<Vec<ComplianceSummary>> {
        self.scan_rows(&self.summary, &self.tables.compliance_summary, &[])
    }

    /// Commit one pack: its summary row, and its detail partition mirrored to
    /// exactly `fetched`, in one transaction across both trees.
    ///
    /// Rows must all belong to the summary's pack; duplicates of a (rule,
    /// resource) pair collapse to the last one given. The returned outcome
    /// counts detail rows.
    pub fn commit_pack(
        &self,
        summary: &ComplianceSummary,
        fetched: &[ComplianceDetail],
    ) -> PipelineResult<ReconcileOutcome> {
        let pack_name = summary.conformance_pack_name.as_str();
        let detail_name = &self.tables.compliance_detail;
        let summary_name = &self.tables.compliance_summary;

        let mut desired = BTreeMap::new();
        for detail in fetched {
            if detail.conformance_pack_name != pack_name {
                return Err(PipelineError::malformed(
                    "conformancePackName",
                    format!(
                        "detail for '{}' submitted under pack '{pack_name}'",
                        detail.conformance_pack_name
                    ),
                ));
            }
            let key = row_key(&[pack_name, &detail.rule_name, &detail.resource_id])?;
            desired.insert(key, self.encode(detail_name, detail)?);
        }
        let prefix = partition_prefix(pack_name)?;
        let (batch, outcome) = self.plan_partition(&self.detail, detail_name, &prefix, &desired)?;
        let summary_key = row_key(&[pack_name])?;
        let sealed_summary = self.cipher.seal(&self.encode(summary_name, summary)?)?;

        (&self.detail, &self.summary).transaction(|(detail_tx, summary_tx)| {
            detail_tx.apply_batch(&batch)?;
            summary_tx.insert(summary_key.as_slice(), sealed_summary.clone())?;
            Ok::<(), ConflictableTransactionError<PipelineError>>(())
        })?;
        Self::flush_tree(&self.detail, detail_name)?;
        Self::flush_tree(&self.summary, summary_name)?;

        Self::audit_partition(detail_name, pack_name, &outcome, &desired);
        CommitAudit::new(summary_name, pack_name).with_counts(1, 0).emit();
        debug!(pack = pack_name, ?outcome, "committed pack");
        Ok(outcome)
    }

    /// Remove a pack's summary row and detail partition together.
    pub fn retire_pack(&self, pack_name: &str) -> PipelineResult<ReconcileOutcome> {
        let detail_name = &self.tables.compliance_detail;
        let summary_name = &self.tables.compliance_summary;

        let desired: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let prefix = partition_prefix(pack_name)?;
        let (batch, outcome) = self.plan_partition(&self.detail, detail_name, &prefix, &desired)?;
        let summary_key = row_key(&[pack_name])?;

        let summary_removed = (&self.detail, &self.summary).transaction(|(detail_tx, summary_tx)| {
            detail_tx.apply_batch(&batch)?;
            let removed = summary_tx.remove(summary_key.as_slice())?;
            Ok::<bool, ConflictableTransactionError<PipelineError>>(removed.is_some())
        })?;
        Self::flush_tree(&self.detail, detail_name)?;
        Self::flush_tree(&self.summary, summary_name)?;

        Self::audit_partition(detail_name, pack_name, &outcome, &desired);
        CommitAudit::new(summary_name, pack_name)
            .with_counts(0, usize::from(summary_removed))
            .emit();
        Ok(outcome)
    }

    pub fn pack_details(&self, pack_name: &str) -> PipelineResult<Vec<ComplianceDetail>> {
        let prefix = partition_prefix(pack_name)?;
        self.scan_rows(&self.detail, &self.tables.compliance_detail, &prefix)
    }

    pub fn all_details(&self) -> PipelineResult<Vec<ComplianceDetail>> {
        self.scan_rows(&self.detail, &self.tables.compliance_detail, &[])
    }

    // --- guidance mapping ---

    /// Replace the whole mapping set. Administrative; the pipeline only reads it.
    pub fn replace_guidance(&self, mappings: &[GuidanceMapping]) -> PipelineResult<ReconcileOutcome> {
        let name = self.tables.guidance_mapping.clone();
        let mut desired = BTreeMap::new();
        for mapping in mappings {
            let key = row_key(&[&mapping.rule_name, &mapping.guidance_id])?;
            desired.insert(key, self.encode(&name, mapping)?);
        }
        self.reconcile_partition(&self.guidance, &name, "*", &[], desired)
    }

    pub fn remove_guidance(&self, rule_name: &str, guidance_id: &str) -> PipelineResult<bool> {
        let key = row_key(&[rule_name, guidance_id])?;
        let removed = self
            .guidance
            .remove(key)
            .map_err(|e| PipelineError::store("remove guidance", e))?;
        Ok(removed.is_some())
    }

    pub fn guidance(&self) -> PipelineResult<Vec<GuidanceMapping>> {
        self.scan_rows(&self.guidance, &self.tables.guidance_mapping, &[])
    }

    // --- remediation backlog ---

    /// Make the backlog exactly `rows`.
    pub fn reconcile_backlog(&self, rows: &[RemediationBacklog]) -> PipelineResult<ReconcileOutcome> {
        let name = self.tables.remediation_backlog.clone();
        let mut desired = BTreeMap::new();
        for row in rows {
            let key = row_key(&[&row.rule_name, &row.guidance_id, &row.resource_id])?;
            desired.insert(key, self.encode(&name, row)?);
        }
        self.reconcile_partition(&self.backlog, &name, "*", &[], desired)
    }

    /// Backlog rows, highest rank first.
    pub fn backlog(&self) -> PipelineResult<Vec<RemediationBacklog>> {
        let mut rows: Vec<RemediationBacklog> =
            self.scan_rows(&self.backlog, &self.tables.remediation_backlog, &[])?;
        rows.sort_by(|a, b| b.rank.cmp(&a.rank));
        Ok(rows)
    }

    // --- questionnaire ---

    /// Write an answer and its risk projection in one transaction.
    pub fn upsert_answer(&self, answer: &QuestionnaireAnswer) -> PipelineResult<()> {
        let key = row_key(&[&answer.workload_id, &answer.lens_alias, &answer.question_id])?;
        let answer_name = &self.tables.questionnaire_answer;
        let risk_name = &self.tables.questionnaire_risk;
        let sealed_answer = self.cipher.seal(&self.encode(answer_name, answer)?)?;
        let sealed_risk = self
            .cipher
            .seal(&self.encode(risk_name, &QuestionnaireRisk::from(answer))?)?;

        (&self.answers, &self.risks).transaction(|(answers, risks)| {
            answers.insert(key.as_slice(), sealed_answer.clone())?;
            risks.insert(key.as_slice(), sealed_risk.clone())?;
            Ok::<(), ConflictableTransactionError<PipelineError>>(())
        })?;
        Self::flush_tree(&self.answers, answer_name)?;
        Self::flush_tree(&self.risks, risk_name)?;

        CommitAudit::new(answer_name, &answer.workload_lens_key())
            .with_counts(1, 0)
            .emit();
        Ok(())
    }

    pub fn answer(
        &self,
        workload_id: &str,
        lens_alias: &str,
        question_id: &str,
    ) -> PipelineResult<Option<QuestionnaireAnswer>> {
        let key = row_key(&[workload_id, lens_alias, question_id])?;
        self.get_row(&self.answers, &self.tables.questionnaire_answer, &key)
    }

    pub fn answers(&self) -> PipelineResult<Vec<QuestionnaireAnswer>> {
        self.scan_rows(&self.answers, &self.tables.questionnaire_answer, &[])
    }

    pub fn risks(&self) -> PipelineResult<Vec<QuestionnaireRisk>> {
        self.scan_rows(&self.risks, &self.tables.questionnaire_risk, &[])
    }

    // --- dead letters ---

    pub fn push_dead_letter(&self, letter: &DeadLetter) -> PipelineResult<()> {
        let stamp = format!("{:020}", letter.received_at.timestamp_millis().max(0));
        let key = row_key(&[&stamp, &letter.id])?;
        self.put_row(&self.dead_letters, &self.tables.dead_letter, &key, letter)
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> PipelineResult<Vec<DeadLetter>> {
        self.scan_rows(&self.dead_letters, &self.tables.dead_letter, &[])
    }
}
