pub mod tests {
    use super::super::{
        DeviceFact,
        GpuCard,
        GpuCardBuilder,
        GpuCardId,
        GpuDevice,
        GpuDeviceBuilder,
        GpuDeviceId,
        HostId,
        VgpuDisplayProperties,
        VgpuProfileId,
        PASSTHROUGH_PROFILE_NAME,
    };

    pub const TEST_HOST_ID: &str = "test_host_1";
    pub const TEST_VM_ID: &str = "test_vm_1";
    pub const TEST_VENDOR_ID: &str = "10de";
    pub const TEST_HARDWARE_DEVICE_ID: &str = "20b5";
    pub const TEST_CARD_NAME: &str = "NVIDIA A100 80GB";
    pub const TEST_VGPU_PROFILE: &str = "GRID A100-4C";

    pub fn mock_card(id: u64) -> GpuCard {
        GpuCardBuilder::default()
            .id(GpuCardId(id))
            .vendor_id(TEST_VENDOR_ID.to_string())
            .device_id(TEST_HARDWARE_DEVICE_ID.to_string())
            .vendor_name("NVIDIA Corporation".to_string())
            .device_name("GA100".to_string())
            .name(TEST_CARD_NAME.to_string())
            .build()
            .unwrap()
    }

    pub fn mock_device(id: u64, bus_address: &str, numa: &str, root: &str) -> GpuDevice {
        GpuDeviceBuilder::default()
            .id(GpuDeviceId(id))
            .host_id(HostId::from(TEST_HOST_ID))
            .card_id(GpuCardId(1))
            .vgpu_profile_id(VgpuProfileId(1))
            .bus_address(bus_address.to_string())
            .numa_node(Some(numa.to_string()))
            .pci_root(Some(root.to_string()))
            .build()
            .unwrap()
    }

    /// A passthrough-capable A100 reported at `bus_address`.
    pub fn mock_passthrough_fact(bus_address: &str, numa: &str, root: &str) -> DeviceFact {
        DeviceFact {
            vendor_id: TEST_VENDOR_ID.to_string(),
            device_id: TEST_HARDWARE_DEVICE_ID.to_string(),
            vendor_name: "NVIDIA Corporation".to_string(),
            device_name: "GA100".to_string(),
            card_name: Some(TEST_CARD_NAME.to_string()),
            bus_address: Some(bus_address.to_string()),
            model_name: PASSTHROUGH_PROFILE_NAME.to_string(),
            parent_bus_address: None,
            numa_node: Some(numa.to_string()),
            pci_root: Some(root.to_string()),
            passthrough_enabled: true,
            max_instances: None,
            display: VgpuDisplayProperties::default(),
            vm_name: None,
        }
    }

    /// A vGPU instance of `model_name` carved out of the device at
    /// `parent_bus_address`.
    pub fn mock_vgpu_fact(
        bus_address: &str,
        parent_bus_address: &str,
        model_name: &str,
        numa: &str,
        root: &str,
    ) -> DeviceFact {
        DeviceFact {
            bus_address: Some(bus_address.to_string()),
            parent_bus_address: Some(parent_bus_address.to_string()),
            model_name: model_name.to_string(),
            passthrough_enabled: false,
            max_instances: Some(4),
            display: VgpuDisplayProperties {
                video_ram_mb: Some(4096),
                max_heads: Some(1),
                max_resolution_x: Some(4096),
                max_resolution_y: Some(2160),
            },
            ..mock_passthrough_fact(bus_address, numa, root)
        }
    }
}
