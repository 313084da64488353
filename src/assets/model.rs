//! Triangle models: `.solid` parsing, the model cache, async loading and the
//! three-phase normals producer.
//!
//! Normals are recomputed as a chain of jobs:
//!
//! 1. face normals, one job per triangle range
//! 2. vertex normals, one job per vertex range, each summing the faces
//!    adjacent to its vertices
//! 3. vertex array refresh, one job per triangle range
//!
//! Each phase is gated on a fence over the previous phase's slices, so the
//! whole chain can be submitted at once and joined at the end of the frame.

use super::file_cache::FileCache;
use super::{AssetError, Result};
use crate::job::{Execute, JobHandle};
use crate::job_system::JobSystem;
use crate::slice::{DisjointBuffer, slice_ranges};
use byteorder::{BigEndian, ReadBytesExt};
use dashmap::DashMap;
use glam::Vec3;
use std::io::Cursor;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Floats per triangle in the vertex array: `[u v nx ny nz x y z]` per corner.
pub const FLOATS_PER_TRIANGLE: usize = 24;
const FLOATS_PER_CORNER: usize = 8;

const CALC_NORMALS_SPLIT: usize = 4;
const NORMALIZE_VERTS_SPLIT: usize = 3;
const UPDATE_VERTS_SPLIT: usize = 3;
/// Most jobs one normals chain occupies: three phases and two fences.
pub const NORMALS_CHAIN_JOBS: usize = CALC_NORMALS_SPLIT + NORMALIZE_VERTS_SPLIT + UPDATE_VERTS_SPLIT + 2;

/// Which loader produced a model. Only `Normal` and `Decal` models carry
/// vertex normals and a maintained vertex array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    NoTexture,
    Normal,
    Decal,
    Raw,
}

impl ModelKind {
    pub fn has_normals(self) -> bool {
        matches!(self, ModelKind::Normal | ModelKind::Decal)
    }
}

/// What a vertex array refresh rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexArrayUpdate {
    /// Texture coordinates, normals and positions.
    Full,
    NormalsAndPositions,
    PositionsOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Triangle {
    pub vertex: [usize; 3],
    pub gx: [f32; 3],
    pub gy: [f32; 3],
}

/// Vertices and triangles as stored in a `.solid` file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolidData {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<Triangle>,
}

impl SolidData {
    /// Parses a big-endian `.solid` file.
    pub fn parse(bytes: &[u8]) -> Result<SolidData> {
        let mut cursor = Cursor::new(bytes);
        let vertex_count = cursor
            .read_u16::<BigEndian>()
            .map_err(AssetError::truncated("model counts"))? as usize;
        let triangle_count = cursor
            .read_u16::<BigEndian>()
            .map_err(AssetError::truncated("model counts"))? as usize;

        let mut vertices = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            vertices.push(read_vec3(&mut cursor, "model vertices")?);
        }

        let mut triangles = Vec::with_capacity(triangle_count);
        for triangle in 0..triangle_count {
            let mut raw = [0i16; 6];
            cursor
                .read_i16_into::<BigEndian>(&mut raw)
                .map_err(AssetError::truncated("model triangles"))?;
            let mut vertex = [0usize; 3];
            // Odd entries are unused.
            for (slot, &index) in vertex.iter_mut().zip(raw.iter().step_by(2)) {
                *slot = usize::try_from(index)
                    .ok()
                    .filter(|&i| i < vertex_count)
                    .ok_or(AssetError::BadIndex {
                        triangle,
                        index: i32::from(index),
                        vertex_count,
                    })?;
            }
            let gx = read_vec3(&mut cursor, "model texture coordinates")?.to_array();
            let gy = read_vec3(&mut cursor, "model texture coordinates")?.to_array();
            triangles.push(Triangle { vertex, gx, gy });
        }

        Ok(SolidData {
            vertices,
            triangles,
        })
    }
}

fn read_vec3(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<Vec3> {
    let mut xyz = [0f32; 3];
    cursor
        .read_f32_into::<BigEndian>(&mut xyz)
        .map_err(AssetError::truncated(what))?;
    Ok(Vec3::from_array(xyz))
}

/// Model data shared with the normals jobs.
///
/// Vertices, triangles and adjacency are read-only while jobs run. The
/// buffers are written by disjoint ranges, one phase at a time.
pub struct ModelGeometry {
    vertices: Vec<Vec3>,
    triangles: Vec<Triangle>,
    /// CSR adjacency: faces touching vertex `v` are
    /// `vertex_faces[face_offsets[v]..face_offsets[v + 1]]`.
    face_offsets: Vec<usize>,
    vertex_faces: Vec<usize>,
    /// Unnormalised cross products, summed into vertex normals.
    face_sums: DisjointBuffer<Vec3>,
    face_normals: DisjointBuffer<Vec3>,
    normals: DisjointBuffer<Vec3>,
    vertex_array: DisjointBuffer<f32>,
}

impl ModelGeometry {
    fn new(data: SolidData, with_normals: bool) -> Self {
        let SolidData {
            vertices,
            triangles,
        } = data;

        let mut face_offsets = vec![0usize; vertices.len() + 1];
        for triangle in &triangles {
            for &v in &triangle.vertex {
                face_offsets[v + 1] += 1;
            }
        }
        for v in 0..vertices.len() {
            face_offsets[v + 1] += face_offsets[v];
        }
        let mut fill = face_offsets.clone();
        let mut vertex_faces = vec![0usize; face_offsets[vertices.len()]];
        for (face, triangle) in triangles.iter().enumerate() {
            for &v in &triangle.vertex {
                vertex_faces[fill[v]] = face;
                fill[v] += 1;
            }
        }

        let normal_count = if with_normals { vertices.len() } else { 0 };
        ModelGeometry {
            face_sums: DisjointBuffer::filled(Vec3::ZERO, triangles.len()),
            face_normals: DisjointBuffer::filled(Vec3::ZERO, triangles.len()),
            normals: DisjointBuffer::filled(Vec3::ZERO, normal_count),
            vertex_array: DisjointBuffer::filled(0.0, triangles.len() * FLOATS_PER_TRIANGLE),
            vertices,
            triangles,
            face_offsets,
            vertex_faces,
        }
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn vertices_mut(&mut self) -> &mut [Vec3] {
        &mut self.vertices
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn triangles_mut(&mut self) -> &mut [Triangle] {
        &mut self.triangles
    }

    pub fn face_normals(&mut self) -> &[Vec3] {
        self.face_normals.get_mut()
    }

    pub fn normals(&mut self) -> &[Vec3] {
        self.normals.get_mut()
    }

    pub fn vertex_array(&mut self) -> &[f32] {
        self.vertex_array.get_mut()
    }

    /// Phase 1.
    ///
    /// # Safety
    ///
    /// Nothing else may access face data of the triangles in `range`.
    unsafe fn compute_face_normals(&self, range: RangeInclusive<usize>, facenormalise: bool) {
        let start = *range.start();
        let sums = unsafe { self.face_sums.slice_mut(range.clone()) };
        let faces = unsafe { self.face_normals.slice_mut(range) };
        for (offset, (sum, face)) in sums.iter_mut().zip(faces.iter_mut()).enumerate() {
            let [a, b, c] = self.triangles[start + offset].vertex;
            let v0 = self.vertices[b] - self.vertices[a];
            let v1 = self.vertices[c] - self.vertices[a];
            *sum = v0.cross(v1);
            *face = if facenormalise {
                sum.normalize_or_zero()
            } else {
                *sum
            };
        }
    }

    /// Phase 2.
    ///
    /// # Safety
    ///
    /// Phase 1 must be complete. Nothing else may access the normals of the
    /// vertices in `range`.
    unsafe fn compute_vertex_normals(&self, range: RangeInclusive<usize>) {
        let start = *range.start();
        let sums = unsafe { self.face_sums.as_slice() };
        let normals = unsafe { self.normals.slice_mut(range) };
        for (offset, normal) in normals.iter_mut().enumerate() {
            let v = start + offset;
            let faces = &self.vertex_faces[self.face_offsets[v]..self.face_offsets[v + 1]];
            let sum: Vec3 = faces.iter().map(|&f| sums[f]).sum();
            *normal = -sum.normalize_or_zero();
        }
    }

    /// Phase 3.
    ///
    /// # Safety
    ///
    /// Phases 1 and 2 must be complete. Nothing else may access the vertex
    /// array entries of the triangles in `range`.
    unsafe fn write_vertex_array(
        &self,
        range: RangeInclusive<usize>,
        update: VertexArrayUpdate,
        flat: bool,
    ) {
        let start = *range.start();
        let floats = range.start() * FLOATS_PER_TRIANGLE..=range.end() * FLOATS_PER_TRIANGLE + 23;
        let out = unsafe { self.vertex_array.slice_mut(floats) };
        let faces = unsafe { self.face_normals.as_slice() };
        let normals = unsafe { self.normals.as_slice() };

        for (offset, chunk) in out.chunks_exact_mut(FLOATS_PER_TRIANGLE).enumerate() {
            let face = start + offset;
            let triangle = &self.triangles[face];
            for (corner, entry) in chunk.chunks_exact_mut(FLOATS_PER_CORNER).enumerate() {
                let v = triangle.vertex[corner];
                if update == VertexArrayUpdate::Full {
                    entry[0] = triangle.gx[corner];
                    entry[1] = triangle.gy[corner];
                }
                if update != VertexArrayUpdate::PositionsOnly {
                    let normal = if flat { -faces[face] } else { normals[v] };
                    entry[2..5].copy_from_slice(&normal.to_array());
                }
                entry[5..8].copy_from_slice(&self.vertices[v].to_array());
            }
        }
    }
}

/// A loaded model.
pub struct Model {
    kind: ModelKind,
    /// Use face normals instead of vertex normals in the vertex array.
    pub flat: bool,
    geometry: Arc<ModelGeometry>,
    bounding_center: Vec3,
    bounding_radius: f32,
}

impl Model {
    /// Builds a model from parsed data and fills its vertex array.
    pub fn from_data(data: SolidData, kind: ModelKind) -> Model {
        let (bounding_center, bounding_radius) = bounding_sphere(&data.vertices);
        let mut model = Model {
            kind,
            flat: false,
            geometry: Arc::new(ModelGeometry::new(data, kind.has_normals())),
            bounding_center,
            bounding_radius,
        };
        model.update_vertex_array(VertexArrayUpdate::Full);
        model
    }

    /// Reads and parses `path` without going through a [`ModelCache`].
    pub fn load(path: &Path, kind: ModelKind, files: &FileCache) -> Result<Model> {
        let bytes = files.read(path)?;
        Ok(Model::from_data(SolidData::parse(&bytes)?, kind))
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn vertex_count(&self) -> usize {
        self.geometry.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.geometry.triangles.len()
    }

    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        (self.bounding_center, self.bounding_radius)
    }

    /// Exclusive access to the geometry. `None` while a normals chain still
    /// holds it.
    pub fn geometry_mut(&mut self) -> Option<&mut ModelGeometry> {
        Arc::get_mut(&mut self.geometry)
    }

    pub fn is_busy(&self) -> bool {
        Arc::strong_count(&self.geometry) > 1
    }

    /// Rewrites the whole vertex array on the calling thread.
    pub fn update_vertex_array(&mut self, update: VertexArrayUpdate) {
        if !self.kind.has_normals() {
            return;
        }
        let flat = self.flat;
        let Some(geometry) = self.geometry_mut() else {
            log::warn!("vertex array refresh skipped: model is in use by jobs");
            return;
        };
        if let Some(last) = geometry.triangles.len().checked_sub(1) {
            // Safety: exclusive access through `&mut`.
            unsafe { geometry.write_vertex_array(0..=last, update, flat) };
        }
    }

    /// Recomputes normals and refreshes the vertex array on the calling thread.
    pub fn calculate_normals(&mut self, facenormalise: bool) {
        if !self.kind.has_normals() {
            return;
        }
        let flat = self.flat;
        let Some(geometry) = self.geometry_mut() else {
            log::warn!("normal calculation skipped: model is in use by jobs");
            return;
        };
        // Safety: exclusive access through `&mut`.
        unsafe {
            if let Some(last) = geometry.triangles.len().checked_sub(1) {
                geometry.compute_face_normals(0..=last, facenormalise);
            }
            if let Some(last) = geometry.vertices.len().checked_sub(1) {
                geometry.compute_vertex_normals(0..=last);
            }
            if let Some(last) = geometry.triangles.len().checked_sub(1) {
                geometry.write_vertex_array(0..=last, VertexArrayUpdate::NormalsAndPositions, flat);
            }
        }
    }

    /// Submits the three-phase normals chain.
    ///
    /// Phase 1 waits for `after` when given. The model's buffers must not be
    /// read until every handle of the returned chain was joined. While an
    /// earlier chain still holds the buffers nothing is submitted.
    pub fn submit_calculate_normals(
        &mut self,
        jobs: &JobSystem,
        facenormalise: bool,
        after: Option<&JobHandle>,
        update: VertexArrayUpdate,
    ) -> NormalsChain {
        if !self.kind.has_normals() {
            return NormalsChain::default();
        }
        if self.is_busy() {
            log::warn!("normals chain skipped: model is in use by jobs");
            return NormalsChain::default();
        }

        let phase1: Vec<JobHandle> = slice_ranges(self.triangle_count(), CALC_NORMALS_SPLIT)
            .into_iter()
            .map(|range| {
                let job = CalculateNormalsJob {
                    geometry: Arc::clone(&self.geometry),
                    range,
                    facenormalise,
                };
                match after {
                    Some(after) => jobs.submit_dependent(after, job),
                    None => jobs.submit(job),
                }
            })
            .collect();
        let faces_done = jobs.submit_fence(phase1);

        let phase2: Vec<JobHandle> = slice_ranges(self.vertex_count(), NORMALIZE_VERTS_SPLIT)
            .into_iter()
            .map(|range| {
                let job = NormalizeVertsJob {
                    geometry: Arc::clone(&self.geometry),
                    range,
                };
                jobs.submit_dependent(&faces_done, job)
            })
            .collect();
        let normals_done = jobs.submit_dependent_fence(&faces_done, phase2);

        let mut handles: Vec<JobHandle> = slice_ranges(self.triangle_count(), UPDATE_VERTS_SPLIT)
            .into_iter()
            .map(|range| {
                let job = UpdateVertexJob {
                    geometry: Arc::clone(&self.geometry),
                    range,
                    update,
                    flat: self.flat,
                };
                jobs.submit_dependent(&normals_done, job)
            })
            .collect();
        handles.push(normals_done);
        handles.push(faces_done);
        NormalsChain { handles }
    }

    /// Loads `path` on a worker. Join the returned load before using the model.
    pub fn submit_load(
        jobs: &JobSystem,
        cache: Arc<ModelCache>,
        path: impl Into<PathBuf>,
        kind: ModelKind,
    ) -> PendingModel {
        let slot = Arc::new(Mutex::new(None));
        let job = LoadModelJob {
            cache,
            path: path.into(),
            kind,
            slot: Arc::clone(&slot),
        };
        PendingModel {
            handle: jobs.submit(job),
            slot,
        }
    }

    /// Loads every path, submitting no more loads at once than the job table
    /// has free slots. Results come back in path order.
    pub fn load_all(
        jobs: &JobSystem,
        cache: &Arc<ModelCache>,
        paths: &[PathBuf],
        kind: ModelKind,
    ) -> Vec<Result<Model>> {
        let mut loaded = Vec::with_capacity(paths.len());
        let mut rest = paths;
        while !rest.is_empty() {
            let free = jobs.capacity().saturating_sub(jobs.live_jobs()).max(1);
            let (batch, tail) = rest.split_at(free.min(rest.len()));
            let pending: Vec<_> = batch
                .iter()
                .map(|path| Model::submit_load(jobs, Arc::clone(cache), path, kind))
                .collect();
            loaded.extend(pending.into_iter().map(|load| load.wait(jobs, true)));
            rest = tail;
        }
        loaded
    }

    /// Moves every vertex by `offset`.
    pub fn translate(&mut self, offset: Vec3) -> bool {
        self.transform(|v| *v += offset)
    }

    /// Scales every vertex per axis.
    pub fn scale(&mut self, factor: Vec3) -> bool {
        self.transform(|v| *v *= factor)
    }

    fn transform(&mut self, op: impl Fn(&mut Vec3)) -> bool {
        let Some(geometry) = self.geometry_mut() else {
            return false;
        };
        geometry.vertices.iter_mut().for_each(op);
        let (center, radius) = bounding_sphere(&geometry.vertices);
        self.bounding_center = center;
        self.bounding_radius = radius;
        self.update_vertex_array(VertexArrayUpdate::PositionsOnly);
        true
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("kind", &self.kind)
            .field("flat", &self.flat)
            .field("vertices", &self.vertex_count())
            .field("triangles", &self.triangle_count())
            .finish()
    }
}

/// Farthest pair of vertices: the center is their midpoint, the radius the
/// square root of half their squared distance.
fn bounding_sphere(vertices: &[Vec3]) -> (Vec3, f32) {
    let mut best = 0.0f32;
    let mut center = vertices.first().copied().unwrap_or(Vec3::ZERO);
    for (i, a) in vertices.iter().enumerate() {
        for b in &vertices[i + 1..] {
            let half = a.distance_squared(*b) / 2.0;
            if half > best {
                best = half;
                center = (*a + *b) / 2.0;
            }
        }
    }
    (center, best.sqrt())
}

/// Handles of a submitted normals chain, in the order they should be joined.
#[derive(Debug, Default)]
pub struct NormalsChain {
    handles: Vec<JobHandle>,
}

impl NormalsChain {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for the whole chain. Afterwards the model's normals are settled.
    pub fn join(self, jobs: &JobSystem, help: bool) {
        jobs.join_all(self.handles, help);
    }

    pub fn into_handles(self) -> Vec<JobHandle> {
        self.handles
    }
}

struct CalculateNormalsJob {
    geometry: Arc<ModelGeometry>,
    range: RangeInclusive<usize>,
    facenormalise: bool,
}

impl Execute for CalculateNormalsJob {
    fn execute(self: Box<Self>) {
        // Safety: phase-1 slices cover disjoint triangle ranges.
        unsafe {
            self.geometry
                .compute_face_normals(self.range.clone(), self.facenormalise)
        };
    }

    fn name(&self) -> &'static str {
        "calculate_normals"
    }
}

struct NormalizeVertsJob {
    geometry: Arc<ModelGeometry>,
    range: RangeInclusive<usize>,
}

impl Execute for NormalizeVertsJob {
    fn execute(self: Box<Self>) {
        // Safety: gated on the phase-1 fence; slices cover disjoint vertex ranges.
        unsafe { self.geometry.compute_vertex_normals(self.range.clone()) };
    }

    fn name(&self) -> &'static str {
        "normalize_verts"
    }
}

struct UpdateVertexJob {
    geometry: Arc<ModelGeometry>,
    range: RangeInclusive<usize>,
    update: VertexArrayUpdate,
    flat: bool,
}

impl Execute for UpdateVertexJob {
    fn execute(self: Box<Self>) {
        // Safety: gated on the phase-2 fence; slices cover disjoint triangle ranges.
        unsafe {
            self.geometry
                .write_vertex_array(self.range.clone(), self.update, self.flat)
        };
    }

    fn name(&self) -> &'static str {
        "update_vertex_array"
    }
}

type ModelSlot = Arc<Mutex<Option<Result<Model>>>>;

struct LoadModelJob {
    cache: Arc<ModelCache>,
    path: PathBuf,
    kind: ModelKind,
    slot: ModelSlot,
}

impl Execute for LoadModelJob {
    fn execute(self: Box<Self>) {
        let result = self.cache.load(&self.path, self.kind);
        if let Err(err) = &result {
            log::warn!("failed to load model {}: {err}", self.path.display());
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    fn name(&self) -> &'static str {
        "load_model"
    }
}

/// A model load in flight.
pub struct PendingModel {
    handle: JobHandle,
    slot: ModelSlot,
}

impl PendingModel {
    /// Joins the load job and returns its result.
    pub fn wait(self, jobs: &JobSystem, help: bool) -> Result<Model> {
        jobs.join(self.handle, help);
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Err(AssetError::NotLoaded(PathBuf::new())))
    }
}

/// Parsed model files keyed by path and kind.
///
/// While active, each file is parsed once and every later load copies the
/// cached data. While inactive, every load parses from scratch.
#[derive(Debug)]
pub struct ModelCache {
    files: Arc<FileCache>,
    active: AtomicBool,
    entries: DashMap<(PathBuf, ModelKind), Arc<SolidData>>,
}

impl ModelCache {
    pub fn new(files: Arc<FileCache>) -> Self {
        ModelCache {
            files,
            active: AtomicBool::new(false),
            entries: DashMap::new(),
        }
    }

    pub fn init(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.active.store(false, Ordering::Release);
        self.entries.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load(&self, path: &Path, kind: ModelKind) -> Result<Model> {
        if !self.is_active() {
            return Model::load(path, kind, &self.files);
        }
        let data = {
            let entry = self
                .entries
                .entry((path.to_path_buf(), kind))
                .or_try_insert_with(|| {
                    let bytes = self.files.read(path)?;
                    SolidData::parse(&bytes).map(Arc::new)
                })?;
            Arc::clone(entry.value())
        };
        Ok(Model::from_data((*data).clone(), kind))
    }
}
