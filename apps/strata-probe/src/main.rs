//! Headless probe: builds a context, uploads through every memory category
//! and spins the frame ring.

use anyhow::{ensure, Context};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use strata_gpu::{GpuConfig, GpuContextBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAMES: usize = 3;
const SPIN_FRAMES: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

fn triangle() -> [Vertex; 3] {
    [
        Vertex {
            position: [0.0, -0.5, 0.0],
            color: [1.0, 0.0, 0.0, 1.0],
        },
        Vertex {
            position: [0.5, 0.5, 0.0],
            color: [0.0, 1.0, 0.0, 1.0],
        },
        Vertex {
            position: [-0.5, 0.5, 0.0],
            color: [0.0, 0.0, 1.0, 1.0],
        },
    ]
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GpuConfig::new("strata-probe")
        .with_frames_in_flight(FRAMES)
        .with_staging_buffer_size(4 * 1024 * 1024);
    let gpu = GpuContextBuilder::with_config(config)
        .build()
        .context("Failed to create GPU context")?;

    let info = gpu.device_info();
    info!("Device: {}", info.summary());
    info!("Queue families: {:?}", gpu.queue_families());
    info!(
        "Memory: gpu {:?}, host {:?}, unified {}",
        gpu.memory().memory_types().gpu().kind,
        gpu.memory().memory_types().host().kind,
        gpu.memory().memory_types().unified()
    );
    info!(
        "Depth format {:?}, wide lines {}",
        gpu.depth_format(),
        gpu.can_set_line_width()
    );

    let memory = gpu.memory();
    let sync = gpu.synchronization();

    // Device-local upload goes through staging unless the memory is mappable.
    let vertices = triangle();
    let mut vertex_buffer = memory.create_gpu_buffer(
        std::mem::size_of_val(&vertices) as u64,
        vk::BufferUsageFlags::VERTEX_BUFFER,
    )?;
    vertex_buffer.copy_pod(memory, &vertices)?;

    let mut read = [Vertex::zeroed(); 3];
    vertex_buffer.read_pod(memory, 0, &mut read)?;
    ensure!(read == vertices, "Vertex read-back mismatch");
    info!(
        "Vertex buffer round trip ok (mapped: {})",
        vertex_buffer.is_mapped()
    );

    // Host buffer that keeps growing, pushing old storage through the ring.
    let mut stream = memory.create_host_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER)?;
    let counters = memory.create_gpu_buffer(16, vk::BufferUsageFlags::STORAGE_BUFFER)?;

    for frame_number in 0..SPIN_FRAMES {
        let frame = frame_number % FRAMES;
        gpu.init_frame(frame)?;

        let payload = vec![frame_number as u8; 48 * (frame_number + 1)];
        stream.copy(memory, &payload)?;

        let scratch = memory.create_host_buffer(256, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        scratch.schedule_free(memory)?;

        let value = frame_number as u32;
        gpu.graphics_queue().record(sync, |device, cmd| unsafe {
            device.cmd_fill_buffer(cmd, counters.handle(), 0, vk::WHOLE_SIZE, value);
        })?;

        let stats = memory.stats();
        info!(
            frame,
            live = stats.live_buffers,
            pending = stats.pending,
            device = stats.usage.device_local,
            host = stats.usage.host_local,
            "Frame done"
        );
    }

    sync.wait_fences()?;
    vertex_buffer.reset();
    vertex_buffer.schedule_free(memory)?;
    stream.schedule_free(memory)?;
    counters.schedule_free(memory)?;

    let (gpu_heap, host_heap) = memory.heap_stats();
    info!(
        "Heaps: gpu {} / {} bytes, host {} / {} bytes",
        gpu_heap.used, gpu_heap.size, host_heap.used, host_heap.size
    );

    gpu.wait_idle()?;
    info!("Probe finished");
    Ok(())
}
