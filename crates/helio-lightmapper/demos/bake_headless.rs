//! Bakes a small courtyard without a window and writes a lightmap cache.
//!
//! `cargo run -p helio-lightmapper --example bake_headless -- out.bin`

use glam::{Vec3, Vec4};
use helio_lightmap::{LevelLight, LevelMesh, RaytraceFlags, SurfaceDesc, TileBinding};
use helio_lightmapper::{LightmapRenderDevice, LightmapperConfig};

const MAX_FRAMES: u32 = 64;

fn wall(level: &mut LevelMesh, corners: [Vec3; 4], normal: Vec3, binding: TileBinding) -> helio_lightmapper::Result<()> {
    level.add_surface(SurfaceDesc {
        positions: &corners,
        indices: &[0, 1, 2, 0, 2, 3],
        plane: Vec4::new(normal.x, normal.y, normal.z, -normal.dot(corners[0])),
        sample_dimension: 0,
        binding,
        use_xy_axis: normal.z.abs() > 0.5,
    })?;
    Ok(())
}

fn courtyard() -> helio_lightmapper::Result<LevelMesh> {
    let mut level = LevelMesh::new();
    level.set_sample_distance(8);

    wall(
        &mut level,
        [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(512.0, 0.0, 0.0),
            Vec3::new(512.0, 512.0, 0.0),
            Vec3::new(0.0, 512.0, 0.0),
        ],
        Vec3::Z,
        TileBinding::new(0, 0),
    )?;
    wall(
        &mut level,
        [
            Vec3::new(0.0, 256.0, 0.0),
            Vec3::new(384.0, 256.0, 0.0),
            Vec3::new(384.0, 256.0, 192.0),
            Vec3::new(0.0, 256.0, 192.0),
        ],
        Vec3::NEG_Y,
        TileBinding::new(1, 1),
    )?;

    level.add_light(LevelLight::new(
        Vec3::new(256.0, 128.0, 96.0),
        400.0,
        Vec3::new(1.0, 0.8, 0.6),
        1.5,
    ));
    level.provision_lightmap(1024, 4);
    Ok(level)
}

fn main() -> helio_lightmapper::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let out = std::env::args().nth(1).unwrap_or_else(|| "lightmap.bin".to_string());

    let config = LightmapperConfig::default()
        .with_raytrace(RaytraceFlags::all())
        .with_ambient(0.05);
    let mut device = LightmapRenderDevice::headless(config)?;
    device.set_level_mesh(Some(courtyard()?));

    // Background bakes are rate limited, keep going until nothing is dirty
    for frame in 0..MAX_FRAMES {
        device.begin_frame()?;
        let tiles: Vec<_> = (0..device.level().tiles.len() as u32)
            .map(helio_lightmapper::TileId)
            .collect();
        let report = device.update_lightmaps(&tiles)?;
        log::info!("frame {}: {:?}", frame, report);
        if device.level().tiles.iter().all(|t| !t.is_dirty()) {
            break;
        }
    }

    device.save_lightmap_cache(&out)?;
    log::info!("Wrote {}", out);
    Ok(())
}
