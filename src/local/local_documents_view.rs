//! Local view of documents: the cached remote state with pending overlays applied.

use std::collections::{BTreeMap, BTreeSet};

use crate::engine::Query;
use crate::error::FirestoreResult;
use crate::local::PersistenceTransaction;
use crate::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, MutationKind,
    Overlay, SnapshotVersion, BATCH_ID_UNKNOWN,
};

/// Remote document a saved overlay applies to. A full-document overlay does not depend on the
/// cached state.
fn base_document(
    txn: &PersistenceTransaction<'_>,
    key: &DocumentKey,
    overlay: Option<&Overlay>,
) -> MutableDocument {
    match overlay {
        Some(overlay) if !matches!(overlay.mutation.kind(), MutationKind::Patch { .. }) => {
            MutableDocument::new_invalid_document(key.clone())
        }
        _ => txn.remote_documents.get_entry(key),
    }
}

pub(crate) fn get_document(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
    let overlay = txn.document_overlays.get_overlay(key);
    let mut document = base_document(txn, key, overlay.as_ref());
    if let Some(overlay) = &overlay {
        overlay.apply(&mut document);
    }
    document
}

pub(crate) fn get_documents(
    txn: &mut PersistenceTransaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
    let documents = txn.remote_documents.get_entries(keys);
    get_local_view_of_documents(txn, documents, &BTreeSet::new())
}

/// Applies saved overlays to `documents`.
///
/// Keys in `existence_changed` whose remote document appeared or disappeared are recomputed
/// from the mutation queue when they have no overlay or a patch overlay, since a patch only
/// applies to an existing document.
pub(crate) fn get_local_view_of_documents(
    txn: &mut PersistenceTransaction<'_>,
    documents: BTreeMap<DocumentKey, MutableDocument>,
    existence_changed: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let overlays = txn.document_overlays.get_overlays(&keys);

    let mut results = BTreeMap::new();
    let mut recalculate = BTreeMap::new();
    for (key, mut document) in documents {
        let overlay = overlays.get(&key);
        let patch_or_missing = overlay
            .map(|o| matches!(o.mutation.kind(), MutationKind::Patch { .. }))
            .unwrap_or(true);
        if existence_changed.contains(&key) && patch_or_missing {
            recalculate.insert(key, document);
        } else {
            if let Some(overlay) = overlay {
                overlay.apply(&mut document);
            }
            results.insert(key, document);
        }
    }

    recalculate_and_save_overlays(txn, &mut recalculate)?;
    results.extend(recalculate);
    Ok(results)
}

/// Rebuilds the overlays of the keys in `documents` from every queued batch that touches them
/// and leaves each document in its local-view state.
///
/// Each overlay is saved under the highest batch id affecting its key. Keys no batch touches
/// lose their overlay.
pub(crate) fn recalculate_and_save_overlays(
    txn: &mut PersistenceTransaction<'_>,
    documents: &mut BTreeMap<DocumentKey, MutableDocument>,
) -> FirestoreResult<()> {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let batches = txn
        .mutation_queue
        .all_mutation_batches_affecting_document_keys(&keys);

    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut keys_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
    for batch in &batches {
        for key in batch.keys() {
            let Some(document) = documents.get_mut(&key) else {
                continue;
            };
            let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
            masks.insert(key.clone(), batch.apply_to_local_view(document, mask));
            keys_by_batch_id
                .entry(batch.batch_id)
                .or_default()
                .insert(key);
        }
    }

    let mut processed = BTreeSet::new();
    for (batch_id, batch_keys) in keys_by_batch_id.iter().rev() {
        let mut overlays = BTreeMap::new();
        for key in batch_keys {
            if !processed.insert(key.clone()) {
                continue;
            }
            let Some(document) = documents.get(key) else {
                continue;
            };
            let mask = masks
                .get(key)
                .cloned()
                .unwrap_or_else(|| Some(FieldMask::empty()));
            match calculate_overlay_mutation(document, mask.as_ref()) {
                Some(mutation) => {
                    overlays.insert(key.clone(), mutation);
                }
                None => txn.document_overlays.remove_overlay(key)?,
            }
        }
        txn.document_overlays.save_overlays(*batch_id, overlays)?;
    }

    for key in keys.difference(&processed) {
        txn.document_overlays.remove_overlay(key)?;
    }
    Ok(())
}

pub(crate) fn recalculate_and_save_overlays_for_document_keys(
    txn: &mut PersistenceTransaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> FirestoreResult<()> {
    let mut documents = txn.remote_documents.get_entries(keys);
    recalculate_and_save_overlays(txn, &mut documents)
}

/// Documents in the local view that match `query`.
///
/// With a non-minimum `since_read_time` only remote documents read after that version are
/// considered, plus every document with a pending overlay.
pub(crate) fn get_documents_matching_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
    if query.is_document_query() {
        let key = DocumentKey::from_path(query.path().clone())?;
        let document = get_document(txn, &key);
        let mut results = BTreeMap::new();
        if document.is_found_document() {
            results.insert(key, document);
        }
        return Ok(results);
    }

    if let Some(collection_id) = query.collection_group_id() {
        let mut results = BTreeMap::new();
        for parent in txn.index_manager.get_collection_parents(collection_id) {
            let collection_query = query.as_collection_query_at_path(parent.child(collection_id));
            results.extend(documents_matching_collection_query(
                txn,
                &collection_query,
                since_read_time,
            ));
        }
        return Ok(results);
    }

    Ok(documents_matching_collection_query(txn, query, since_read_time))
}

fn documents_matching_collection_query(
    txn: &PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> BTreeMap<DocumentKey, MutableDocument> {
    let mut candidates = txn
        .remote_documents
        .get_documents_matching_query(query, since_read_time);
    let overlays = txn
        .document_overlays
        .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN);

    for key in overlays.keys() {
        if !candidates.contains_key(key) {
            candidates.insert(key.clone(), txn.remote_documents.get_entry(key));
        }
    }

    candidates
        .into_iter()
        .filter_map(|(key, mut document)| {
            if let Some(overlay) = overlays.get(&key) {
                overlay.apply(&mut document);
            }
            query.matches(&document).then_some((key, document))
        })
        .collect()
}
