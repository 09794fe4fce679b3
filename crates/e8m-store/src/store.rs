use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use e8m_core::snapshot::{WireEdge, WireLineage, WireNode, WireProjection};
use e8m_core::{
    CURRENT_VERSION, ConsolidationState, EngineConfig, MemoryStore, NodeId, PolicySnapshot,
    Snapshot, Vec8,
};

use crate::error::{Result, StoreError};
use crate::schema;

const POLICY_KEY: &str = "policy";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    // --- Engine state ---

    /// Replace the persisted engine state with `snapshot` in one transaction.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute_batch(
            "DELETE FROM edges; DELETE FROM nodes; DELETE FROM lineage;
             DELETE FROM lineage_reseeds; DELETE FROM roots; DELETE FROM projection;",
        )?;

        set_metadata_on(&tx, "version", &snapshot.version)?;
        set_metadata_on(&tx, "timestamp", &snapshot.timestamp)?;
        set_metadata_on(&tx, "next_id", &snapshot.next_id.to_string())?;
        set_metadata_on(&tx, "merge_count", &snapshot.merge_count.to_string())?;
        set_metadata_on(&tx, "reseed_count", &snapshot.reseed_count.to_string())?;

        {
            let mut stmt = tx.prepare("INSERT INTO roots (id, coords) VALUES (?1, ?2)")?;
            for (id, root) in snapshot.roots.iter().enumerate() {
                stmt.execute(params![id, encode_f64s(root)])?;
            }
        }

        tx.execute(
            "INSERT INTO projection (id, input_dim, lattice_scale, vals) VALUES (1, ?1, ?2, ?3)",
            params![
                snapshot.projection.input_dim,
                snapshot.projection.lattice_scale,
                encode_f64s(&snapshot.projection.values),
            ],
        )?;

        {
            let mut node_stmt = tx.prepare(
                "INSERT INTO nodes (id, raw_embedding, lattice_coord, nearest_root_id, shell,
                    rotor_w, rotor_x, rotor_y, rotor_z, entropy, created_at, q_infinity, s_q,
                    state, state_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            let mut edge_stmt = tx.prepare(
                "INSERT INTO edges (src, dst, weight, rotor_w, rotor_x, rotor_y, rotor_z)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for node in &snapshot.nodes {
                let (state, state_ref) = state_columns(node.state);
                let [w, x, y, z] = node.rotor;
                node_stmt.execute(params![
                    node.id,
                    encode_f64s(&node.raw_embedding),
                    encode_f64s(&node.lattice_coord),
                    node.nearest_root_id,
                    node.shell,
                    w,
                    x,
                    y,
                    z,
                    node.entropy,
                    node.created_at,
                    node.q_infinity,
                    node.s_q,
                    state,
                    state_ref,
                ])?;
                for edge in &node.edges {
                    let [w, x, y, z] = edge.rotor;
                    edge_stmt.execute(params![node.id, edge.to, edge.weight, w, x, y, z])?;
                }
            }
        }

        {
            let mut member_stmt = tx.prepare(
                "INSERT INTO lineage (summary, position, member) VALUES (?1, ?2, ?3)",
            )?;
            let mut reseed_stmt =
                tx.prepare("INSERT INTO lineage_reseeds (summary, reseeds) VALUES (?1, ?2)")?;
            for entry in &snapshot.lineage {
                for (position, member) in entry.members.iter().enumerate() {
                    member_stmt.execute(params![entry.summary, position, member])?;
                }
                reseed_stmt.execute(params![entry.summary, entry.reseeds])?;
            }
        }

        tx.commit()?;
        tracing::debug!(
            nodes = snapshot.nodes.len(),
            lineages = snapshot.lineage.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// The persisted engine state, or `None` for a database that has never
    /// been saved to.
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let Some(projection) = self.load_projection()? else {
            return Ok(None);
        };

        let roots = self.load_roots()?;
        let mut nodes = self.load_nodes()?;
        self.attach_edges(&mut nodes)?;
        let lineage = self.load_lineage()?;

        Ok(Some(Snapshot {
            version: self
                .get_metadata("version")?
                .unwrap_or_else(|| CURRENT_VERSION.to_string()),
            timestamp: self.get_metadata("timestamp")?.unwrap_or_default(),
            roots,
            projection,
            nodes,
            next_id: self.counter("next_id")?,
            lineage,
            merge_count: self.counter("merge_count")?,
            reseed_count: self.counter("reseed_count")?,
        }))
    }

    /// Restore the engine from disk, or start an empty one when nothing has
    /// been saved yet.
    pub fn open_memory(&self, config: EngineConfig) -> Result<MemoryStore> {
        let memory = match self.load_snapshot()? {
            Some(snapshot) => MemoryStore::restore(config, &snapshot)?,
            None => MemoryStore::new(config)?,
        };
        Ok(memory)
    }

    pub fn save_memory(&self, memory: &MemoryStore) -> Result<()> {
        self.save_snapshot(&memory.snapshot())
    }

    // --- Policy ---

    pub fn save_policy(&self, policy: &PolicySnapshot) -> Result<()> {
        let json = serde_json::to_string(policy)?;
        self.set_metadata(POLICY_KEY, &json)
    }

    pub fn load_policy(&self) -> Result<Option<PolicySnapshot>> {
        match self.get_metadata(POLICY_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // --- Load helpers ---

    fn counter(&self, key: &str) -> Result<u64> {
        match self.get_metadata(key)? {
            Some(v) => v
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("metadata {key} = '{v}': {e}"))),
            None => Ok(0),
        }
    }

    fn load_projection(&self) -> Result<Option<WireProjection>> {
        let row = self
            .conn
            .query_row(
                "SELECT input_dim, lattice_scale, vals FROM projection WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, usize>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(input_dim, lattice_scale, vals)| {
            Ok(WireProjection {
                input_dim,
                lattice_scale,
                values: decode_f64s(&vals)?,
            })
        })
        .transpose()
    }

    fn load_roots(&self) -> Result<Vec<Vec8>> {
        let mut stmt = self.conn.prepare("SELECT coords FROM roots ORDER BY id")?;
        let blobs: Vec<Vec<u8>> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        blobs.iter().map(|b| decode_vec8(b)).collect()
    }

    fn load_nodes(&self) -> Result<Vec<WireNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, raw_embedding, lattice_coord, nearest_root_id, shell,
                    rotor_w, rotor_x, rotor_y, rotor_z, entropy, created_at,
                    q_infinity, s_q, state, state_ref
             FROM nodes ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(NodeRow {
                    id: row.get(0)?,
                    raw_embedding: row.get(1)?,
                    lattice_coord: row.get(2)?,
                    nearest_root_id: row.get(3)?,
                    shell: row.get(4)?,
                    rotor: [row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?],
                    entropy: row.get(9)?,
                    created_at: row.get(10)?,
                    q_infinity: row.get(11)?,
                    s_q: row.get(12)?,
                    state: row.get(13)?,
                    state_ref: row.get(14)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|r| {
                Ok(WireNode {
                    id: r.id,
                    raw_embedding: decode_f64s(&r.raw_embedding)?,
                    lattice_coord: decode_vec8(&r.lattice_coord)?,
                    nearest_root_id: r.nearest_root_id,
                    shell: r.shell,
                    rotor: r.rotor,
                    entropy: r.entropy,
                    created_at: r.created_at,
                    q_infinity: r.q_infinity,
                    s_q: r.s_q,
                    state: parse_state(r.id, &r.state, r.state_ref)?,
                    edges: Vec::new(),
                })
            })
            .collect()
    }

    fn attach_edges(&self, nodes: &mut [WireNode]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT src, dst, weight, rotor_w, rotor_x, rotor_y, rotor_z
             FROM edges ORDER BY src, dst",
        )?;
        let edges: Vec<(NodeId, WireEdge)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    WireEdge {
                        to: row.get(1)?,
                        weight: row.get(2)?,
                        rotor: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
                    },
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        // Nodes are ordered by id, so each edge's source is found by binary search.
        for (src, edge) in edges {
            let slot = nodes
                .binary_search_by_key(&src, |n| n.id)
                .map_err(|_| StoreError::InvalidData(format!("edge from unknown node {src}")))?;
            nodes[slot].edges.push(edge);
        }
        Ok(())
    }

    fn load_lineage(&self) -> Result<Vec<WireLineage>> {
        let mut stmt = self
            .conn
            .prepare("SELECT summary, member FROM lineage ORDER BY summary, position")?;
        let rows: Vec<(NodeId, NodeId)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let mut lineage: Vec<WireLineage> = Vec::new();
        for (summary, member) in rows {
            match lineage.last_mut() {
                Some(entry) if entry.summary == summary => entry.members.push(member),
                _ => lineage.push(WireLineage {
                    summary,
                    members: vec![member],
                    reseeds: 0,
                }),
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT summary, reseeds FROM lineage_reseeds")?;
        let reseeds: Vec<(NodeId, u32)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        for (summary, count) in reseeds {
            match lineage.binary_search_by_key(&summary, |e| e.summary) {
                Ok(slot) => lineage[slot].reseeds = count,
                Err(slot) => lineage.insert(
                    slot,
                    WireLineage {
                        summary,
                        members: Vec::new(),
                        reseeds: count,
                    },
                ),
            }
        }
        Ok(lineage)
    }
}

struct NodeRow {
    id: NodeId,
    raw_embedding: Vec<u8>,
    lattice_coord: Vec<u8>,
    nearest_root_id: usize,
    shell: u32,
    rotor: [f64; 4],
    entropy: f64,
    created_at: u64,
    q_infinity: f64,
    s_q: f64,
    state: String,
    state_ref: Option<NodeId>,
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn state_columns(state: ConsolidationState) -> (&'static str, Option<NodeId>) {
    match state {
        ConsolidationState::Active => ("active", None),
        ConsolidationState::Merged { parent } => ("merged", Some(parent)),
        ConsolidationState::Seed { origin } => ("seed", Some(origin)),
    }
}

fn parse_state(id: NodeId, state: &str, state_ref: Option<NodeId>) -> Result<ConsolidationState> {
    match (state, state_ref) {
        ("active", _) => Ok(ConsolidationState::Active),
        ("merged", Some(parent)) => Ok(ConsolidationState::Merged { parent }),
        ("seed", Some(origin)) => Ok(ConsolidationState::Seed { origin }),
        _ => Err(StoreError::InvalidData(format!(
            "node {id} has state '{state}' with reference {state_ref:?}"
        ))),
    }
}

fn encode_f64s(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f64s(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(StoreError::InvalidData(format!(
            "vector blob of {} bytes is not a whole number of f64s",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect())
}

fn decode_vec8(bytes: &[u8]) -> Result<Vec8> {
    let values = decode_f64s(bytes)?;
    let len = values.len();
    values
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("expected 8 coordinates, got {len}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use e8m_core::{ConsolidationPolicy, MoodState, OutcomeScore, PolicyArm};

    const LATER: u64 = 3_600_000;

    fn config() -> EngineConfig {
        EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        }
    }

    fn make_memory() -> MemoryStore {
        let memory = MemoryStore::new(config()).unwrap();
        for v in [
            [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [1.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [2.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            [0.5, -0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
        ] {
            memory.ingest_at(&v, 1_000).unwrap();
        }
        memory.scan_and_merge(0.01).unwrap();
        let parent = memory.snapshot().lineage[0].summary;
        memory.reseed_at(parent, 2_000).unwrap();
        memory
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let original = make_memory().snapshot();

        store.save_snapshot(&original).unwrap();
        let loaded = store.load_snapshot().unwrap().unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_empty_db() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_snapshot().unwrap().is_none());
        assert!(store.load_policy().unwrap().is_none());
    }

    #[test]
    fn test_open_memory_resumes_state() {
        let store = Store::open_in_memory().unwrap();
        let memory = make_memory();
        store.save_memory(&memory).unwrap();

        let resumed = store.open_memory(config()).unwrap();
        assert_eq!(resumed.stats(), memory.stats());
        let q = [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(resumed.query_knn(&q, 4), memory.query_knn(&q, 4));
    }

    #[test]
    fn test_open_memory_on_fresh_db() {
        let store = Store::open_in_memory().unwrap();
        let memory = store.open_memory(config()).unwrap();
        assert_eq!(memory.live_count(), 0);
    }

    #[test]
    fn test_embedding_precision_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let memory = MemoryStore::new(config()).unwrap();
        let v = [0.1, -0.2, 1.0 / 3.0, 1e-300, 2.5, -7.125, 0.0, 1e10];
        let id = memory.ingest_at(&v, 0).unwrap();
        store.save_memory(&memory).unwrap();

        let loaded = store.load_snapshot().unwrap().unwrap();
        let node = loaded.nodes.iter().find(|n| n.id == id).unwrap();
        assert_eq!(node.raw_embedding, v.to_vec());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let store = Store::open_in_memory().unwrap();
        let memory = make_memory();

        store.save_memory(&memory).unwrap();
        store.save_memory(&memory).unwrap();

        let loaded = store.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), memory.stats().node_count);
    }

    #[test]
    fn test_retrieval_matches_after_reload() {
        let store = Store::open_in_memory().unwrap();
        let mut cfg = config();
        cfg.retrieval.record_retrievals = false;
        let memory = MemoryStore::restore(cfg.clone(), &make_memory().snapshot()).unwrap();
        store.save_memory(&memory).unwrap();
        let resumed = store.open_memory(cfg).unwrap();

        let q = [1.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mood = MoodState::neutral();
        let a = memory.retrieve_at(&q, &mood, 4, LATER).unwrap();
        let b = resumed.retrieve_at(&q, &mood, 4, LATER).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_corrupted_root_refused() {
        let store = Store::open_in_memory().unwrap();
        store.save_memory(&make_memory()).unwrap();
        store
            .conn()
            .execute(
                "UPDATE roots SET coords = ?1 WHERE id = 7",
                [encode_f64s(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])],
            )
            .unwrap();

        let err = store.open_memory(config()).err().unwrap();
        assert!(matches!(err, StoreError::Core(e8m_core::CoreError::Structural(_))));
    }

    #[test]
    fn test_invalid_state_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.save_memory(&make_memory()).unwrap();
        store
            .conn()
            .execute("UPDATE nodes SET state = 'merged', state_ref = NULL WHERE id = 0", [])
            .unwrap();
        assert!(matches!(store.load_snapshot(), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_policy_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut policy = ConsolidationPolicy::new(&config().policy);
        policy.update(
            PolicyArm::Merge,
            OutcomeScore {
                novelty: 0.25,
                coherence: 0.75,
            },
        );

        store.save_policy(&policy.save()).unwrap();
        let loaded = store.load_policy().unwrap().unwrap();
        let restored = ConsolidationPolicy::restore(loaded);
        assert_eq!(restored.estimate(PolicyArm::Merge).pulls, 1);
        assert_eq!(restored.estimate(PolicyArm::Reseed).pulls, 0);
    }

    #[test]
    fn test_metadata() {
        let store = Store::open_in_memory().unwrap();

        assert!(store.get_metadata("foo").unwrap().is_none());

        store.set_metadata("foo", "bar").unwrap();
        assert_eq!(store.get_metadata("foo").unwrap(), Some("bar".to_string()));

        store.set_metadata("foo", "baz").unwrap();
        assert_eq!(store.get_metadata("foo").unwrap(), Some("baz".to_string()));
    }

    #[test]
    fn test_decode_rejects_ragged_blob() {
        assert!(decode_f64s(&[0u8; 12]).is_err());
        assert!(decode_vec8(&encode_f64s(&[1.0; 7])).is_err());
    }
}
