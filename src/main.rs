use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

use rust_dvio::geometry::SE3;
use rust_dvio::settings::Settings;
use rust_dvio::sim::{make_system, SimBackend, SimWorld};
use rust_dvio::system::full_system::TrajectoryOptions;

fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let frames: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(40);

    // Synthetic constant-velocity sweep over a textured plane.
    let world = SimWorld::new();
    let settings = Arc::new(Settings {
        debugout_runquiet: false,
        ..Settings::default()
    });
    let (mut system, stats) = make_system(&world, settings, SimBackend::new());

    for i in 0..frames {
        let pose = SE3::new(
            UnitQuaternion::identity(),
            Vector3::new(0.01 * i as f64, 0.002 * i as f64, 0.0),
        );
        let image = world.next_frame(&system, &pose, 0.1 * i as f64);
        system.process_frame(&image, i as i64, &[], None)?;

        if system.is_lost() {
            info!(frame = i, "tracking lost, stopping");
            break;
        }
    }

    {
        let shared = system.shared_state();
        let stats = stats.lock();
        info!(
            frames = shared.shells.lock().len(),
            keyframes = shared.keyframes.lock().len(),
            window = shared.mapping.lock().window.len(),
            tracked = stats.frames,
            candidate_evals = stats.candidate_calls,
            "run finished"
        );
    }

    let out = Path::new("trajectory.txt");
    system.save_trajectory(out, TrajectoryOptions::default())?;
    info!(path = %out.display(), "trajectory written");

    system.shutdown();
    Ok(())
}
