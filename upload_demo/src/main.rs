//! Headless upload demo
//!
//! Brings up a device without a window, uploads a vertex payload through
//! the transfer pipeline, reads it back and checks the bytes match.
//!
//! Usage: `upload_demo [config.toml]`

use bytemuck::{Pod, Zeroable};
use vk_core::prelude::*;

const DEFAULT_CONFIG_PATH: &str = "upload_demo.toml";

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

fn triangle() -> [Vertex; 3] {
    [
        Vertex { position: [0.0, -0.5, 0.0], color: [1.0, 0.0, 0.0] },
        Vertex { position: [0.5, 0.5, 0.0], color: [0.0, 1.0, 0.0] },
        Vertex { position: [-0.5, 0.5, 0.0], color: [0.0, 0.0, 1.0] },
    ]
}

fn run(config: ContextConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut context = DeviceContext::new(config)?;
    context.subscribe(LifecycleEvent::CreateDevice, |context| {
        if let Ok(access) = context.access() {
            log::info!("Device ready: {}", access.capabilities().device_name());
        }
    });
    context.subscribe(LifecycleEvent::DestroyDevice, |_| log::info!("Device going away"));

    context.create_instance()?;
    let index = context.select_first_suitable()?;
    log::info!("Using physical device {index}");
    context.create_device()?;

    let access = context.access()?.clone();
    let mut transfer = context.create_transfer_pipeline()?;

    let vertices = triangle();
    let payload: &[u8] = bytemuck::cast_slice(&vertices);
    let buffer = VertexBuffer::new(&access, payload.len() as vk::DeviceSize, vk::BufferUsageFlags::empty())?;
    log::info!(
        "Vertex buffer: {} bytes, host visible: {}",
        buffer.size(),
        buffer.is_host_visible()
    );

    transfer.transfer_slice(buffer.resource(), &vertices, 0)?;

    let mut read_back = vec![0u8; payload.len()];
    transfer.read_back(buffer.resource(), &mut read_back, 0)?;
    if read_back != payload {
        return Err("vertex payload changed on the round trip".into());
    }
    log::info!("Round trip of {} bytes verified", payload.len());

    // Positions only, spread into a 16-byte aligned storage layout
    let positions: Vec<[f32; 3]> = vertices.iter().map(|vertex| vertex.position).collect();
    let stride = StorageBuffer::aligned_size(access.capabilities(), 16).max(16);
    let storage = StorageBuffer::new(&access, stride * positions.len() as vk::DeviceSize, vk::BufferUsageFlags::empty())?;
    let copy = StridedCopy::scatter(positions.len() as u32, 12, stride);
    transfer.transfer_strided(storage.resource(), bytemuck::cast_slice(&positions), copy)?;
    log::info!("Scattered {} positions at a {stride} byte stride", positions.len());

    drop(storage);
    drop(buffer);
    log::info!("Staged copy commands recorded: {}", transfer.copy_commands_recorded());
    drop(transfer);
    context.terminate();
    Ok(())
}

fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match ContextConfig::load_or_default(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            std::process::exit(2);
        }
    };
    init_logging_with_level(&config.log_level);

    if let Err(e) = run(config) {
        log::error!("Upload demo failed: {e}");
        std::process::exit(1);
    }
}
