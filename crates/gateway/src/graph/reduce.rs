use proto_gateway::data::Doc;
use std::collections::HashMap;

/// Combine branch outputs arriving at a fan-in.
///
/// The default is an id-keyed merge; deployments flagged `no_reduce`
/// concatenate instead. Branches must be given in deterministic order
/// (topological rank, then edge insertion order): the merge is
/// last-writer-wins for scalar conflicts.
pub fn reduce(branches: Vec<Vec<Doc>>, no_reduce: bool) -> Vec<Doc> {
    if no_reduce {
        branches.into_iter().flatten().collect()
    } else {
        merge_docs(branches)
    }
}

// Merge by document id, preserving first-seen order. No id is ever lost.
fn merge_docs(branches: Vec<Vec<Doc>>) -> Vec<Doc> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Doc> = HashMap::new();

    for doc in branches.into_iter().flatten() {
        match by_id.entry(doc.id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                merge_doc(entry.get_mut(), doc);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                order.push(doc.id.clone());
                entry.insert(doc);
            }
        }
    }

    order
        .into_iter()
        .map(|id| by_id.remove(&id).expect("id was inserted above"))
        .collect()
}

// Later-arriving non-null values override scalars, the embedding is
// replaced wholesale, and chunk lists concatenate.
fn merge_doc(into: &mut Doc, from: Doc) {
    if !from.text.is_empty() {
        into.text = from.text;
    }
    if !from.embedding.is_empty() {
        into.embedding = from.embedding;
    }
    for (key, value) in from.attributes {
        if value.kind.is_some() {
            into.attributes.insert(key, value);
        }
    }
    into.chunks.extend(from.chunks);
}
