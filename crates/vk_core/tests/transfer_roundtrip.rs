//! Device round trip through the transfer pipeline
//!
//! Needs a Vulkan loader and at least one device; returns early otherwise.
//! A single test function, since only one context may exist per process.

use std::cell::RefCell;
use std::rc::Rc;

use vk_core::prelude::*;
use vk_core::vulkan::initialization::{ContextState, DeviceCapabilities};
use vk_core::vulkan::resources::BindPhase;

const FENCE_TIMEOUT_NS: u64 = 3_000_000_000;

fn headless_context(events: &Rc<RefCell<Vec<LifecycleEvent>>>) -> Option<DeviceContext> {
    let config = ContextConfig::new("transfer_roundtrip")
        .with_validation(false)
        .with_fence_timeout(FENCE_TIMEOUT_NS);
    let mut context = match DeviceContext::new(config) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("skipping: {e}");
            return None;
        }
    };
    for event in [LifecycleEvent::CreateDevice, LifecycleEvent::DestroyDevice] {
        let events = Rc::clone(events);
        context.subscribe(event, move |_| events.borrow_mut().push(event));
    }

    if let Err(e) = context.create_instance() {
        eprintln!("skipping: {e}");
        return None;
    }
    if let Err(e) = context.select_first_suitable() {
        eprintln!("skipping: {e}");
        return None;
    }
    context.create_device().ok()?;
    Some(context)
}

#[test]
fn test_device_round_trip() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let Some(mut context) = headless_context(&events) else {
        return;
    };
    assert_eq!(context.state(), ContextState::DeviceCreated);
    assert_eq!(*events.borrow(), vec![LifecycleEvent::CreateDevice]);
    assert!(DeviceContext::new(ContextConfig::default()).is_err());

    let access = context.access().unwrap().clone();

    // The device runs with everything the physical device supports
    let supported = DeviceCapabilities::query(context.instance().unwrap(), access.capabilities().physical_device);
    let enabled = access.capabilities().features;
    assert_eq!(enabled.sampler_anisotropy, supported.features.sampler_anisotropy);
    assert_eq!(enabled.geometry_shader, supported.features.geometry_shader);
    assert_eq!(enabled.shader_int64, supported.features.shader_int64);
    let mut transfer = context.create_transfer_pipeline().unwrap();
    assert_eq!(transfer.settings().fence_timeout_ns, FENCE_TIMEOUT_NS);
    assert!(!transfer.settings().force_staging);

    // Contiguous upload and read-back
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let vertices = VertexBuffer::new(&access, payload.len() as u64, vk::BufferUsageFlags::empty()).unwrap();
    assert_eq!(vertices.resource().phase(), BindPhase::Bound);
    transfer.transfer_data(vertices.resource(), &payload, 0).unwrap();

    let mut out = vec![0u8; payload.len()];
    transfer.read_back(vertices.resource(), &mut out, 0).unwrap();
    assert_eq!(out, payload);

    // Partial write at an offset leaves the rest alone
    transfer.transfer_data(vertices.resource(), &[0xAA; 16], 64).unwrap();
    transfer.read_back(vertices.resource(), &mut out, 0).unwrap();
    assert_eq!(&out[64..80], &[0xAA; 16]);
    assert_eq!(&out[..64], &payload[..64]);
    assert_eq!(&out[80..], &payload[80..]);

    // Out-of-range writes are rejected before touching the device
    assert!(transfer.transfer_data(vertices.resource(), &[0; 8], 4092).is_err());

    // Strided scatter
    let source: Vec<u32> = (1..=4).collect();
    let storage = StorageBuffer::new(&access, 64, vk::BufferUsageFlags::empty()).unwrap();
    transfer.transfer_data(storage.resource(), &[0; 64], 0).unwrap();
    transfer
        .transfer_strided(storage.resource(), bytemuck::cast_slice(&source), StridedCopy::scatter(4, 4, 16))
        .unwrap();
    let mut scattered = vec![0u8; 64];
    transfer.read_back(storage.resource(), &mut scattered, 0).unwrap();
    let words: Vec<u32> = scattered
        .chunks_exact(4)
        .map(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    assert_eq!(words, vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]);

    // Staging only grows
    let capacity = transfer.staging().capacity();
    transfer.transfer_data(vertices.resource(), &[1; 8], 0).unwrap();
    assert!(transfer.staging().capacity() >= capacity);

    // 64 KiB into device-local memory, once staged by force and once by default
    let large: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    let device_local = BufferResource::new(
        &access,
        large.len() as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        &[vk::MemoryPropertyFlags::DEVICE_LOCAL],
    )
    .unwrap();

    let mut staged = context.create_transfer_pipeline().unwrap().with_force_staging(true);
    staged.transfer_data(&device_local, &large, 0).unwrap();
    assert_eq!(staged.copy_commands_recorded(), 1);
    assert!(staged.staging().capacity() >= large.len() as u64);

    let mut staged_back = vec![0u8; large.len()];
    staged.read_back(&device_local, &mut staged_back, 0).unwrap();
    assert_eq!(staged.copy_commands_recorded(), 2);
    assert_eq!(staged_back, large);

    let reversed: Vec<u8> = large.iter().rev().copied().collect();
    let before = transfer.copy_commands_recorded();
    transfer.transfer_data(&device_local, &reversed, 0).unwrap();
    let expected_copies = if device_local.is_host_visible() { 0 } else { 1 };
    assert_eq!(transfer.copy_commands_recorded() - before, expected_copies);

    let mut direct_back = vec![0u8; large.len()];
    transfer.read_back(&device_local, &mut direct_back, 0).unwrap();
    assert_eq!(direct_back, reversed);
    staged.read_back(&device_local, &mut staged_back, 0).unwrap();
    assert_eq!(staged_back, reversed);

    // Staging grows past its current capacity and refuses to while mapped
    let grown = staged.staging().capacity() * 2;
    staged.staging().expand(grown).unwrap();
    assert_eq!(staged.staging().capacity(), grown);
    staged.staging().map(16).unwrap();
    assert!(staged.staging().expand(grown * 2).is_err());
    assert_eq!(staged.staging().capacity(), grown);
    staged.staging().unmap().unwrap();
    drop(staged);
    drop(device_local);

    // Texture upload through either the blit or the copy path
    let pixels = vec![0x7Fu8; 16 * 16 * 4];
    let texture = transfer
        .create_texture_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 16, height: 16 },
            &pixels,
            ImageBarrier::shader_read(),
        )
        .unwrap();
    assert!(texture.is_bound());
    assert!(texture.create_view().is_ok());

    drop(texture);
    drop(storage);
    drop(vertices);
    drop(transfer);

    context.terminate();
    assert_eq!(context.state(), ContextState::Terminated);
    assert_eq!(
        *events.borrow(),
        vec![LifecycleEvent::CreateDevice, LifecycleEvent::DestroyDevice]
    );
    context.terminate();
}
