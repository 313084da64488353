use clap::Parser;
use framejobs::assets::file_cache::FileCache;
use framejobs::assets::model::{
    Model, ModelCache, ModelKind, NORMALS_CHAIN_JOBS, NormalsChain, SolidData, Triangle, VertexArrayUpdate,
};
use framejobs::assets::pvr::MipLevel;
use framejobs::assets::texture::{TexelFormat, Texture, TextureUploader};
use framejobs::sprite::{FrameEnv, SpawnRequest, SpriteKind, SpriteSystem};
use framejobs::{JobSystem, PinningStrategy, SchedulerConfig};
use glam::{Mat4, Vec3};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "framejobs")]
#[command(about = "Drives a few frames of loader, normals and sprite jobs")]
struct CliArgs {
    /// Worker threads to spawn.
    #[arg(long, env = "FRAMEJOBS_WORKERS", default_value_t = default_workers())]
    workers: usize,

    /// Job table capacity.
    #[arg(long, env = "FRAMEJOBS_MAX_JOBS", default_value_t = 100)]
    max_jobs: usize,

    /// Directory scanned for `.solid` models and `.pvr` textures.
    #[arg(long, env = "FRAMEJOBS_ASSET_DIR")]
    asset_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    frames: usize,

    /// Pin worker i to logical core i.
    #[arg(long)]
    pin: bool,

    /// Write a chrome://tracing file of every executed job.
    #[arg(long, env = "FRAMEJOBS_TRACE")]
    trace: Option<PathBuf>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(2)
}

/// Counts uploads instead of talking to a GPU.
#[derive(Default)]
struct CountingUploader {
    textures: u32,
    bytes: usize,
}

impl TextureUploader for CountingUploader {
    fn create(&mut self, previous: Option<u32>, _has_mipmap: bool) -> u32 {
        previous.unwrap_or_else(|| {
            self.textures += 1;
            self.textures
        })
    }

    fn upload_level(&mut self, _id: u32, _format: TexelFormat, _mip: &MipLevel, bytes: &[u8]) {
        self.bytes += bytes.len();
    }
}

fn main() {
    env_logger::init();
    let args = CliArgs::parse();

    let config = SchedulerConfig {
        max_jobs: args.max_jobs,
        pinning: if args.pin {
            PinningStrategy::Linear
        } else {
            PinningStrategy::None
        },
        trace_jobs: args.trace.is_some(),
        ..SchedulerConfig::default()
    };
    let jobs = match JobSystem::init(config) {
        Ok(jobs) => jobs,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };
    jobs.spawn_workers(args.workers);
    println!("framejobs: {} workers, {} job slots\n", args.workers, jobs.capacity());

    let files = Arc::new(FileCache::new());
    files.init();
    let models = Arc::new(ModelCache::new(Arc::clone(&files)));
    models.init();

    let (model_paths, texture_paths) = match &args.asset_dir {
        Some(dir) => scan_assets(dir),
        None => (Vec::new(), Vec::new()),
    };

    // Loaders, in batches that fit the job table
    let start = Instant::now();
    let mut loaded: Vec<Model> = Model::load_all(&jobs, &models, &model_paths, ModelKind::Normal)
        .into_iter()
        .filter_map(|load| match load {
            Ok(model) => Some(model),
            Err(err) => {
                log::warn!("{err}");
                None
            }
        })
        .collect();
    if loaded.is_empty() {
        loaded.push(Model::from_data(demo_grid(64), ModelKind::Normal));
    }

    let mut uploader = CountingUploader::default();
    for batch in texture_paths.chunks(jobs.capacity()) {
        let textures: Vec<_> = batch
            .iter()
            .map(|path| {
                let mut texture = Texture::new();
                let handle = texture.submit_load_job(&jobs, path, true, Arc::clone(&files));
                (texture, handle)
            })
            .collect();
        for (mut texture, handle) in textures {
            jobs.join(handle, true);
            if let Err(err) = texture.upload(&mut uploader) {
                log::warn!("{err}");
            }
        }
    }
    println!(
        "Loaded {} models and {} textures ({} bytes) in {:?}\n",
        loaded.len(),
        uploader.textures,
        uploader.bytes,
        start.elapsed()
    );

    // Frames
    let mut sprites = SpriteSystem::new(2000);
    for i in 0..300 {
        let kind = match i % 4 {
            0 => SpriteKind::Flame,
            1 => SpriteKind::Smoke,
            2 => SpriteKind::Snow,
            _ => SpriteKind::Cloud,
        };
        sprites.make_sprite(SpawnRequest {
            kind,
            position: Vec3::new((i % 20) as f32, 0.0, (i / 20) as f32),
            velocity: Vec3::Y,
            color: [1.0, 0.8, 0.5],
            size: 1.0 + (i % 3) as f32,
            opacity: 1.0,
        });
    }

    for frame in 0..args.frames {
        let start = Instant::now();
        let env = FrameEnv {
            multiplier: 1.0 / 60.0,
            wind: Vec3::new(0.2, 0.0, 0.1),
            viewer: Vec3::new(10.0, 2.0, -5.0),
            view: Mat4::look_at_rh(Vec3::new(10.0, 2.0, -5.0), Vec3::new(10.0, 0.0, 10.0), Vec3::Y),
            ..FrameEnv::default()
        };
        let sprite_frame = sprites.submit_animation(&jobs, env);

        // Settle the chains in flight whenever the next one would not fit.
        let mut chains: Vec<NormalsChain> = Vec::new();
        for model in loaded.iter_mut() {
            if jobs.live_jobs() + NORMALS_CHAIN_JOBS > jobs.capacity() {
                for chain in chains.drain(..) {
                    chain.join(&jobs, true);
                }
            }
            chains.push(model.submit_calculate_normals(&jobs, true, None, VertexArrayUpdate::NormalsAndPositions));
        }

        for chain in chains {
            chain.join(&jobs, true);
        }
        sprites.finish_animation(&jobs, sprite_frame, true);
        println!(
            "Frame {frame}: {} sprites alive, {} jobs still live, {:?}",
            sprites.len(),
            jobs.live_jobs(),
            start.elapsed()
        );
    }

    models.clear();
    files.clear();

    let panicked = jobs.kill_workers();
    if panicked > 0 {
        log::error!("{panicked} workers panicked");
    }

    if let Some(path) = args.trace {
        match framejobs::tracing::export_to_file(&path) {
            Ok(()) => println!("\nTrace written to {}", path.display()),
            Err(err) => log::error!("failed to write trace {}: {err}", path.display()),
        }
    }
}

fn scan_assets(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot read {}: {err}", dir.display());
            return (Vec::new(), Vec::new());
        }
    };
    let mut models = Vec::new();
    let mut textures = Vec::new();
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        match path.extension().and_then(|e| e.to_str()) {
            Some("solid") => models.push(path),
            Some("pvr") => textures.push(path),
            _ => {}
        }
    }
    (models, textures)
}

/// A flat strip of `quads` quads, used when no models were found.
fn demo_grid(quads: usize) -> SolidData {
    let mut vertices = Vec::with_capacity((quads + 1) * 2);
    for i in 0..=quads {
        vertices.push(Vec3::new(i as f32, 0.0, 0.0));
        vertices.push(Vec3::new(i as f32, 1.0, 0.0));
    }
    let triangles = (0..quads)
        .flat_map(|i| {
            let a = i * 2;
            [[a, a + 2, a + 1], [a + 1, a + 2, a + 3]]
        })
        .map(|vertex| Triangle {
            vertex,
            gx: [0.0, 1.0, 0.0],
            gy: [0.0, 0.0, 1.0],
        })
        .collect();
    SolidData {
        vertices,
        triangles,
    }
}
