//! Descriptor set caching.
//!
//! [`DescriptorSetPool`] hands out one descriptor set per distinct binding
//! content for a fixed pool and layout. Requests are hashed in binding order,
//! so the same bindings listed in another order are a different request.

use crate::device::{DeviceApi, VulkanDevice};
use crate::error::{GpuError, Result};
use crate::hash::{combine_value, hash_value};
use crate::host_buffer::Suballocation;
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// Buffer range bound to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// Image view, layout and sampler bound to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub image_view: vk::ImageView,
    pub image_layout: vk::ImageLayout,
    pub sampler: vk::Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Buffer(BufferBinding),
    Image(ImageBinding),
}

impl DescriptorResource {
    fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Image(_) => "image",
        }
    }
}

/// One binding of a descriptor set request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: DescriptorResource,
}

impl DescriptorBinding {
    pub fn buffer(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            resource: DescriptorResource::Buffer(BufferBinding {
                buffer,
                offset,
                range,
            }),
        }
    }

    pub fn image(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
        sampler: vk::Sampler,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            resource: DescriptorResource::Image(ImageBinding {
                image_view,
                image_layout,
                sampler,
            }),
        }
    }

    /// Dynamic uniform binding of a host buffer sub-allocation. The offset
    /// goes in at bind time and the range runs to the end of the page, so
    /// allocations starting at the same offset share a set whatever their
    /// size.
    pub fn dynamic_uniform(binding: u32, allocation: &Suballocation) -> Self {
        let info = allocation.descriptor_info();
        Self::buffer(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            info.buffer,
            info.offset,
            info.range,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Buffer,
    Image,
}

fn expected_resource(descriptor_type: vk::DescriptorType) -> Option<ResourceKind> {
    match descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => Some(ResourceKind::Buffer),
        vk::DescriptorType::SAMPLER
        | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        | vk::DescriptorType::SAMPLED_IMAGE
        | vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::INPUT_ATTACHMENT => Some(ResourceKind::Image),
        _ => None,
    }
}

fn validate(binding: &DescriptorBinding) -> Result<()> {
    let expected = expected_resource(binding.descriptor_type)
        .ok_or(GpuError::UnsupportedDescriptorType(binding.descriptor_type))?;
    let actual = match binding.resource {
        DescriptorResource::Buffer(_) => ResourceKind::Buffer,
        DescriptorResource::Image(_) => ResourceKind::Image,
    };

    if expected == actual {
        Ok(())
    } else {
        Err(GpuError::DescriptorResourceMismatch {
            binding: binding.binding,
            descriptor_type: binding.descriptor_type,
            resource: binding.resource.kind(),
        })
    }
}

/// Content hash of a request. Binding order matters.
pub fn request_hash(bindings: &[DescriptorBinding]) -> u64 {
    bindings
        .iter()
        .fold(hash_value(&bindings.len()), |seed, binding| {
            combine_value(seed, binding)
        })
}

struct CachedSet {
    bindings: Vec<DescriptorBinding>,
    set: vk::DescriptorSet,
}

/// Cache of descriptor sets allocated from one pool for one layout.
///
/// Owned by a single frame or renderer; not shared across threads.
pub struct DescriptorSetPool {
    device: Arc<dyn DeviceApi>,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    cache: HashMap<u64, Vec<CachedSet>>,
}

impl DescriptorSetPool {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Self {
        Self {
            device,
            pool,
            layout,
            cache: HashMap::new(),
        }
    }

    /// Rebind to a new pool and layout and forget every cached set.
    pub fn recreate(&mut self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) {
        self.pool = pool;
        self.layout = layout;
        self.cache.clear();
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Number of distinct sets allocated since the last recreate.
    pub fn cached_sets(&self) -> usize {
        self.cache.values().map(Vec::len).sum()
    }

    /// Descriptor set holding exactly `bindings`.
    ///
    /// A cached set is returned without any device call. Otherwise a new set
    /// is allocated and written in one batched update. Pool exhaustion is
    /// returned as an error; the backing pool must be sized up front.
    pub fn get_descriptor_set(&mut self, bindings: &[DescriptorBinding]) -> Result<vk::DescriptorSet> {
        let hash = request_hash(bindings);
        if let Some(cached) = self
            .cache
            .get(&hash)
            .and_then(|entries| entries.iter().find(|entry| entry.bindings == bindings))
        {
            tracing::trace!(hash, "descriptor set cache hit");
            return Ok(cached.set);
        }

        for binding in bindings {
            validate(binding)?;
        }

        // SAFETY: pool and layout belong to this device.
        let set = match unsafe { self.device.allocate_descriptor_set(self.pool, self.layout) } {
            Ok(set) => set,
            Err(e) => {
                tracing::error!(
                    cached = self.cached_sets(),
                    "descriptor pool exhausted or allocation failed: {e}"
                );
                return Err(e.into());
            }
        };

        self.write(set, bindings);
        self.cache.entry(hash).or_default().push(CachedSet {
            bindings: bindings.to_vec(),
            set,
        });
        tracing::debug!(hash, cached = self.cached_sets(), "allocated descriptor set");

        Ok(set)
    }

    fn write(&self, set: vk::DescriptorSet, bindings: &[DescriptorBinding]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = bindings
            .iter()
            .filter_map(|binding| match binding.resource {
                DescriptorResource::Buffer(buffer) => Some(
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffer.buffer)
                        .offset(buffer.offset)
                        .range(buffer.range),
                ),
                DescriptorResource::Image(_) => None,
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = bindings
            .iter()
            .filter_map(|binding| match binding.resource {
                DescriptorResource::Image(image) => Some(
                    vk::DescriptorImageInfo::default()
                        .image_view(image.image_view)
                        .image_layout(image.image_layout)
                        .sampler(image.sampler),
                ),
                DescriptorResource::Buffer(_) => None,
            })
            .collect();

        let mut writes = Vec::with_capacity(bindings.len());
        let (mut next_buffer, mut next_image) = (0, 0);
        for binding in bindings {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.binding)
                .descriptor_type(binding.descriptor_type);
            let write = match binding.resource {
                DescriptorResource::Buffer(_) => {
                    next_buffer += 1;
                    write.buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1]))
                }
                DescriptorResource::Image(_) => {
                    next_image += 1;
                    write.image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                }
            };
            writes.push(write);
        }

        // SAFETY: every write targets the freshly allocated set and points at
        // infos that outlive the call.
        unsafe { self.device.update_descriptor_sets(&writes) };
    }
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Uniform buffer addressed with a dynamic offset, for host buffer pool
    /// sub-allocations.
    pub fn dynamic_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1, stage_flags)
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        let layout = device
            .raw()
            .create_descriptor_set_layout(&layout_info, device.callbacks())?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the pool a [`DescriptorSetPool`] allocates from.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_descriptor_pool(
    device: &VulkanDevice,
    max_sets: u32,
    pool_sizes: &[vk::DescriptorPoolSize],
) -> Result<vk::DescriptorPool> {
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(max_sets)
        .pool_sizes(pool_sizes);

    let pool = device
        .raw()
        .create_descriptor_pool(&create_info, device.callbacks())?;
    Ok(pool)
}

/// Destroy a pool and layout made by [`create_descriptor_pool`] and
/// [`DescriptorSetLayoutBuilder::build`].
///
/// # Safety
/// No set allocated from the pool may be in use.
pub unsafe fn destroy_descriptor_objects(
    device: &VulkanDevice,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) {
    device.raw().destroy_descriptor_pool(pool, device.callbacks());
    device
        .raw()
        .destroy_descriptor_set_layout(layout, device.callbacks());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockOp};
    use ash::vk::Handle;

    fn pool(mock: &Arc<MockDevice>) -> DescriptorSetPool {
        DescriptorSetPool::new(
            mock.clone(),
            vk::DescriptorPool::from_raw(1),
            vk::DescriptorSetLayout::from_raw(2),
        )
    }

    fn uniform(binding: u32, offset: u64) -> DescriptorBinding {
        DescriptorBinding::buffer(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::Buffer::from_raw(10),
            offset,
            256,
        )
    }

    fn texture(binding: u32) -> DescriptorBinding {
        DescriptorBinding::image(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ImageView::from_raw(20),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::Sampler::from_raw(30),
        )
    }

    #[test]
    fn identical_requests_share_one_set() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let request = [uniform(0, 0), texture(1)];

        let first = pool.get_descriptor_set(&request).unwrap();
        let second = pool.get_descriptor_set(&request.clone()).unwrap();
        assert_eq!(first, second);

        let calls = mock.calls();
        assert_eq!(calls.descriptor_allocations, 1);
        assert_eq!(calls.descriptor_update_calls, 1);
        assert_eq!(calls.descriptor_writes.len(), 2);
        assert_eq!(pool.cached_sets(), 1);
    }

    #[test]
    fn writes_carry_binding_contents() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let set = pool
            .get_descriptor_set(&[texture(3), uniform(0, 512)])
            .unwrap();

        let writes = mock.calls().descriptor_writes;
        assert_eq!(writes[0].set, set);
        assert_eq!(writes[0].binding, 3);
        assert_eq!(
            writes[0].image,
            Some((
                vk::ImageView::from_raw(20),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            ))
        );
        assert_eq!(writes[0].buffer, None);
        assert_eq!(writes[1].binding, 0);
        assert_eq!(writes[1].buffer, Some((vk::Buffer::from_raw(10), 512, 256)));
    }

    #[test]
    fn different_offsets_are_different_sets() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);

        let a = pool.get_descriptor_set(&[uniform(0, 0)]).unwrap();
        let b = pool.get_descriptor_set(&[uniform(0, 256)]).unwrap();
        assert_ne!(a, b);
        assert_eq!(mock.calls().descriptor_allocations, 2);
    }

    #[test]
    fn dynamic_sets_follow_the_allocation_offset() {
        use crate::host_buffer::{HostBufferPool, HostBufferPoolConfig, HostBufferUsage};

        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let mut uniforms = HostBufferPool::new(
            mock.clone(),
            HostBufferPoolConfig::new(HostBufferUsage::Uniform),
        );

        let small = uniforms.suballocate(&[1u8; 16]).unwrap();
        let first = pool
            .get_descriptor_set(&[DescriptorBinding::dynamic_uniform(0, &small)])
            .unwrap();

        uniforms.reset().unwrap();
        let large = uniforms.suballocate(&[2u8; 48]).unwrap();
        assert_eq!((large.page, large.offset), (small.page, small.offset));
        let again = pool
            .get_descriptor_set(&[DescriptorBinding::dynamic_uniform(0, &large)])
            .unwrap();
        assert_eq!(first, again, "size does not change the descriptor");

        let next = uniforms.suballocate(&[3u8; 16]).unwrap();
        assert_eq!(next.page, large.page);
        let other = pool
            .get_descriptor_set(&[DescriptorBinding::dynamic_uniform(0, &next)])
            .unwrap();
        assert_ne!(first, other, "a later offset leaves less of the page in range");
        assert_eq!(pool.cached_sets(), 2);

        uniforms.destroy().unwrap();
    }

    #[test]
    fn binding_order_is_part_of_the_key() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let forward = [uniform(0, 0), texture(1)];
        let reversed = [texture(1), uniform(0, 0)];
        assert_ne!(request_hash(&forward), request_hash(&reversed));

        pool.get_descriptor_set(&forward).unwrap();
        pool.get_descriptor_set(&reversed).unwrap();
        pool.get_descriptor_set(&forward).unwrap();
        assert_eq!(pool.cached_sets(), 2);
    }

    #[test]
    fn hash_match_alone_is_not_trusted() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let request = [uniform(0, 0)];
        let stale = vk::DescriptorSet::from_raw(0xdead);
        pool.cache.insert(
            request_hash(&request),
            vec![CachedSet {
                bindings: vec![uniform(0, 4096)],
                set: stale,
            }],
        );

        let set = pool.get_descriptor_set(&request).unwrap();
        assert_ne!(set, stale);
        assert_eq!(pool.cached_sets(), 2);
    }

    #[test]
    fn exhaustion_is_a_hard_error() {
        let mock = Arc::new(MockDevice::new().with_descriptor_capacity(1));
        let mut pool = pool(&mock);

        pool.get_descriptor_set(&[uniform(0, 0)]).unwrap();
        let err = pool.get_descriptor_set(&[uniform(0, 256)]).unwrap_err();
        assert_eq!(err.as_vk_result(), vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert_eq!(pool.cached_sets(), 1);

        mock.fail(MockOp::AllocateDescriptorSet, vk::Result::ERROR_DEVICE_LOST);
        assert!(pool.get_descriptor_set(&[uniform(0, 0)]).is_ok(), "hits need no device");
    }

    #[test]
    fn unsupported_and_mismatched_bindings_are_rejected() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);

        let texel = DescriptorBinding::buffer(
            0,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            vk::Buffer::from_raw(10),
            0,
            64,
        );
        assert!(matches!(
            pool.get_descriptor_set(&[texel]),
            Err(GpuError::UnsupportedDescriptorType(_))
        ));

        let mut mismatched = texture(2);
        mismatched.descriptor_type = vk::DescriptorType::STORAGE_BUFFER;
        assert!(matches!(
            pool.get_descriptor_set(&[mismatched]),
            Err(GpuError::DescriptorResourceMismatch {
                binding: 2,
                resource: "image",
                ..
            })
        ));
        assert_eq!(mock.calls().descriptor_allocations, 0);
    }

    #[test]
    fn recreate_forgets_cached_sets() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        pool.get_descriptor_set(&[uniform(0, 0)]).unwrap();

        pool.recreate(
            vk::DescriptorPool::from_raw(3),
            vk::DescriptorSetLayout::from_raw(4),
        );
        assert_eq!(pool.cached_sets(), 0);
        pool.get_descriptor_set(&[uniform(0, 0)]).unwrap();
        assert_eq!(mock.calls().descriptor_allocations, 2);
    }
}
