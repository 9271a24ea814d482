#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use anyhow::Result;
    use data_model::{
        test_objects::tests::{
            mock_passthrough_fact,
            mock_vgpu_fact,
            TEST_CARD_NAME,
            TEST_HARDWARE_DEVICE_ID,
            TEST_HOST_ID,
            TEST_VENDOR_ID,
            TEST_VGPU_PROFILE,
        },
        DeviceFact,
        DeviceState,
        DeviceType,
        GpuDevice,
        GpuDeviceId,
        HostId,
        PackingTier,
        ResourceState,
        VgpuProfileId,
        VmId,
        PASSTHROUGH_PROFILE_NAME,
    };
    use state_store::{
        error::InventoryError,
        requests::{CreateGpuCardRequest, RequestPayload, StateMachineUpdateRequest, UpdateOutcome},
        scanner::InventoryRead,
        test_state_store::TestStateStore,
    };

    use crate::{
        allocator::Allocator,
        capacity::CapacityAggregator,
        reconciler::Reconciler,
        resource_state::ResourceStateController,
    };

    struct TestEngine {
        store: TestStateStore,
        reconciler: Reconciler,
        allocator: Arc<Allocator>,
        capacity: CapacityAggregator,
        resource_state: ResourceStateController,
    }

    impl TestEngine {
        async fn new() -> Result<Self> {
            let store = TestStateStore::new().await?;
            store.create_host().await?;
            let state = store.inventory_state.clone();
            Ok(Self {
                reconciler: Reconciler::new(state.clone()),
                allocator: Arc::new(Allocator::new(state.clone())),
                capacity: CapacityAggregator::new(state.clone()),
                resource_state: ResourceStateController::new(state),
                store,
            })
        }

        fn host(&self) -> HostId {
            HostId::from(TEST_HOST_ID)
        }

        fn devices(&self) -> Result<Vec<GpuDevice>> {
            Ok(self
                .store
                .inventory_state
                .reader()
                .devices_for_host(&self.host())?)
        }

        fn device_at(&self, bus_address: &str) -> Result<GpuDevice> {
            self.devices()?
                .into_iter()
                .find(|d| d.bus_address == bus_address)
                .ok_or_else(|| anyhow::anyhow!("no device at {}", bus_address))
        }

        fn profile_id(&self, name: &str) -> Result<VgpuProfileId> {
            let reader = self.store.inventory_state.reader();
            let card = reader
                .card_by_hardware_id(TEST_VENDOR_ID, TEST_HARDWARE_DEVICE_ID)?
                .ok_or_else(|| anyhow::anyhow!("card not discovered"))?;
            reader
                .profiles_for_card(card.id)?
                .into_iter()
                .find(|p| p.name == name)
                .map(|p| p.id)
                .ok_or_else(|| anyhow::anyhow!("no profile {}", name))
        }

        fn free_passthrough(&self) -> Result<u32> {
            Ok(self
                .capacity
                .capacity_snapshot(&self.host())?
                .get(TEST_CARD_NAME, PASSTHROUGH_PROFILE_NAME)
                .free)
        }
    }

    /// A, B on numa0/root0, C on numa0/root1, D, E on numa1/root2.
    fn topology_facts() -> Vec<DeviceFact> {
        vec![
            mock_passthrough_fact("0000:17:00.0", "0", "pci0000:16"),
            mock_passthrough_fact("0000:18:00.0", "0", "pci0000:16"),
            mock_passthrough_fact("0000:3b:00.0", "0", "pci0000:3a"),
            mock_passthrough_fact("0000:86:00.0", "1", "pci0000:85"),
            mock_passthrough_fact("0000:87:00.0", "1", "pci0000:85"),
        ]
    }

    fn bus_addresses(devices: &[data_model::AllocatedDevice]) -> HashSet<&str> {
        devices.iter().map(|d| d.bus_address.as_str()).collect()
    }

    #[tokio::test]
    async fn test_discovery_creates_catalog_and_devices() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = vec![
            mock_passthrough_fact("0000:3b:00.0", "0", "pci0000:3a"),
            mock_vgpu_fact("mdev-0001", "0000:3b:00.0", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
        ];
        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.created, 2);
        assert!(summary.skipped.is_empty());

        let reader = engine.store.inventory_state.reader();
        let cards = reader.list_cards()?;
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].name, TEST_CARD_NAME);
        let profiles = reader.profiles_for_card(cards[0].id)?;
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![PASSTHROUGH_PROFILE_NAME, TEST_VGPU_PROFILE]);
        assert_eq!(profiles[1].max_instances_per_gpu, 4);
        assert_eq!(profiles[1].display.video_ram_mb, Some(4096));

        let parent = engine.device_at("0000:3b:00.0")?;
        let child = engine.device_at("mdev-0001")?;
        assert_eq!(parent.device_type, DeviceType::Pci);
        assert_eq!(child.device_type, DeviceType::VgpuOnly);
        assert_eq!(child.parent_device_id, Some(parent.id));
        assert_eq!(parent.state, DeviceState::Free);
        assert_eq!(parent.resource_state, ResourceState::Enabled);
        Ok(())
    }

    #[tokio::test]
    async fn test_parent_links_do_not_depend_on_fact_order() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = vec![
            mock_vgpu_fact("mdev-0001", "0000:3b:00.0", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
            mock_passthrough_fact("0000:3b:00.0", "0", "pci0000:3a"),
            mock_vgpu_fact("mdev-0002", "0000:5e:00.0", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
        ];
        engine.reconciler.reconcile(&engine.host(), &facts).await?;

        let parent = engine.device_at("0000:3b:00.0")?;
        assert_eq!(engine.device_at("mdev-0001")?.parent_device_id, Some(parent.id));
        // Unknown parent bus address leaves the link unset.
        assert_eq!(engine.device_at("mdev-0002")?.parent_device_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_nested_parent_links_are_rejected() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = vec![
            mock_passthrough_fact("0000:3b:00.0", "0", "pci0000:3a"),
            mock_vgpu_fact("mdev-0001", "0000:3b:00.0", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
            // Points at a child device, which would make a third level.
            mock_vgpu_fact("mdev-0002", "mdev-0001", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
            mock_vgpu_fact("mdev-0003", "mdev-0003", TEST_VGPU_PROFILE, "0", "pci0000:3a"),
        ];
        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.created, 4);
        assert!(summary.skipped.is_empty());

        let parent = engine.device_at("0000:3b:00.0")?;
        assert_eq!(engine.device_at("mdev-0001")?.parent_device_id, Some(parent.id));
        assert_eq!(engine.device_at("mdev-0002")?.parent_device_id, None);
        assert_eq!(engine.device_at("mdev-0003")?.parent_device_id, None);

        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.unchanged, 4);
        assert_eq!(engine.device_at("mdev-0002")?.parent_device_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_facts_are_skipped() -> Result<()> {
        let engine = TestEngine::new().await?;
        let mut no_bus = mock_passthrough_fact("0000:3b:00.0", "0", "pci0000:3a");
        no_bus.bus_address = Some("  ".to_string());
        let mut no_model = mock_passthrough_fact("0000:5e:00.0", "0", "pci0000:3a");
        no_model.model_name = String::new();
        let facts = vec![
            no_bus,
            mock_passthrough_fact("0000:17:00.0", "0", "pci0000:16"),
            mock_passthrough_fact("0000:17:00.0", "1", "pci0000:85"),
            no_model,
        ];
        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped.len(), 3);
        assert!(summary.skipped.iter().any(|reason| reason.contains("more than once")));

        // The first report of a repeated bus address wins.
        let device = engine.device_at("0000:17:00.0")?;
        assert_eq!(device.numa_node.as_deref(), Some("0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_facts_parse_from_agent_json() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts: Vec<DeviceFact> = serde_json::from_str(
            r#"[
                {"vendor_id": "10de", "device_id": "20b5", "card_name": "NVIDIA A100 80GB",
                 "bus_address": "0000:3b:00.0", "model_name": "passthrough",
                 "numa_node": "-1"},
                {"vendor_id": "10de", "device_id": "20b5", "model_name": "passthrough"}
            ]"#,
        )?;
        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped.len(), 1);
        let device = engine.device_at("0000:3b:00.0")?;
        assert_eq!(device.numa_bucket(), "unknown");
        assert_eq!(device.pci_root_bucket(), "unknown");
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine.store.register_vm("vm-1", "web-01").await?;
        let mut facts = topology_facts();
        facts[2].vm_name = Some("web-01".to_string());
        facts.push(mock_vgpu_fact(
            "mdev-0001",
            "0000:86:00.0",
            TEST_VGPU_PROFILE,
            "1",
            "pci0000:85",
        ));

        let first = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(first.created, 6);
        let before = engine.devices()?;

        let second = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 6);
        assert_eq!(engine.devices()?, before);
        assert_eq!(engine.store.inventory_state.reader().list_cards()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reported_occupancy_uses_registered_vms() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine.store.register_vm("vm-1", "web-01").await?;
        let mut facts = topology_facts();
        facts[0].vm_name = Some("web-01".to_string());
        facts[1].vm_name = Some("not-registered".to_string());
        engine.reconciler.reconcile(&engine.host(), &facts).await?;

        let occupied = engine.device_at("0000:17:00.0")?;
        assert_eq!(occupied.state, DeviceState::Allocated);
        assert_eq!(occupied.vm_id, Some(VmId::from("vm-1")));
        let unknown_vm = engine.device_at("0000:18:00.0")?;
        assert_eq!(unknown_vm.state, DeviceState::Free);
        assert_eq!(unknown_vm.vm_id, None);
        assert_eq!(engine.free_passthrough()?, 4);

        // The VM is gone from the next report.
        facts[0].vm_name = None;
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(engine.device_at("0000:17:00.0")?.state, DeviceState::Free);
        assert_eq!(engine.free_passthrough()?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_device_is_marked_error_not_deleted() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = topology_facts();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let before = engine.device_at("0000:87:00.0")?;

        let summary = engine
            .reconciler
            .reconcile(&engine.host(), &facts[..4])
            .await?;
        assert_eq!(summary.marked_lost, 1);
        let lost = engine.device_at("0000:87:00.0")?;
        assert_eq!(lost.id, before.id);
        assert_eq!(lost.state, DeviceState::Error);
        assert_eq!(lost.resource_state, ResourceState::Disabled);
        assert_eq!(lost.card_id, before.card_id);
        assert_eq!(lost.vgpu_profile_id, before.vgpu_profile_id);
        assert_eq!(engine.devices()?.len(), 5);

        // Marking it lost again writes nothing.
        let summary = engine
            .reconciler
            .reconcile(&engine.host(), &facts[..4])
            .await?;
        assert_eq!(summary.marked_lost, 0);

        // Reported again, it becomes usable again.
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let back = engine.device_at("0000:87:00.0")?;
        assert_eq!(back.state, DeviceState::Free);
        assert_eq!(back.resource_state, ResourceState::Enabled);
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_device_drops_its_vm() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = topology_facts();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 2)
            .await?;

        engine.reconciler.reconcile(&engine.host(), &facts[2..]).await?;
        for bus_address in ["0000:17:00.0", "0000:18:00.0"] {
            let device = engine.device_at(bus_address)?;
            assert_eq!(device.state, DeviceState::Error);
            assert_eq!(device.vm_id, None);
        }
        let reader = engine.store.inventory_state.reader();
        assert!(reader.devices_for_vm(&VmId::from("vm-1"))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_administratively_disabled_device_stays_disabled() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = topology_facts();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let device = engine.device_at("0000:17:00.0")?;
        engine
            .resource_state
            .set_resource_state(&[device.id], ResourceState::Disabled)
            .await?;

        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(
            engine.device_at("0000:17:00.0")?.resource_state,
            ResourceState::Disabled
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_device_that_goes_missing_stays_disabled() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts = topology_facts();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let device = engine.device_at("0000:87:00.0")?;
        engine
            .resource_state
            .set_resource_state(&[device.id], ResourceState::Disabled)
            .await?;

        engine
            .reconciler
            .reconcile(&engine.host(), &facts[..4])
            .await?;
        assert_eq!(engine.device_at("0000:87:00.0")?.state, DeviceState::Error);

        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let back = engine.device_at("0000:87:00.0")?;
        assert_eq!(back.state, DeviceState::Free);
        assert_eq!(back.resource_state, ResourceState::Disabled);
        assert!(!back.is_allocatable());

        // The admin's enable is still the way back in.
        engine
            .resource_state
            .set_resource_state(&[device.id], ResourceState::Enabled)
            .await?;
        assert!(engine.device_at("0000:87:00.0")?.is_allocatable());
        Ok(())
    }

    #[tokio::test]
    async fn test_topology_drift_is_applied() -> Result<()> {
        let engine = TestEngine::new().await?;
        let mut facts = topology_facts();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;

        facts[0].numa_node = Some("1".to_string());
        facts[0].passthrough_enabled = false;
        let summary = engine.reconciler.reconcile(&engine.host(), &facts).await?;
        assert_eq!(summary.updated, 1);
        let device = engine.device_at("0000:17:00.0")?;
        assert_eq!(device.numa_node.as_deref(), Some("1"));
        assert_eq!(device.device_type, DeviceType::VgpuOnly);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_unknown_host_fails() -> Result<()> {
        let engine = TestEngine::new().await?;
        let err = engine
            .reconciler
            .reconcile(&HostId::from("unknown-host"), &topology_facts())
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { kind: "host", .. }));
        assert!(engine.store.inventory_state.reader().list_cards()?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_discovery_creates_one_card() -> Result<()> {
        let engine = TestEngine::new().await?;
        let hosts: Vec<HostId> = (1..=4).map(|i| HostId::new(format!("kvm-{:02}", i))).collect();
        for host in &hosts {
            engine.store.upsert_host(host.get()).await?;
        }

        let state = engine.store.inventory_state.clone();
        let mut handles = Vec::new();
        for host in hosts.clone() {
            let reconciler = Reconciler::new(state.clone());
            handles.push(tokio::spawn(async move {
                reconciler.reconcile(&host, &topology_facts()).await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let reader = state.reader();
        assert_eq!(reader.list_cards()?.len(), 1);
        let card = reader.list_cards()?[0].clone();
        assert_eq!(reader.profiles_for_card(card.id)?.len(), 1);
        for host in &hosts {
            assert_eq!(reader.devices_for_host(host)?.len(), 5);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_allocation_prefers_shared_numa_and_root() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;

        let response = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 2)
            .await?;
        assert_eq!(response.tier, PackingTier::SameNumaSameRoot);
        assert_eq!(
            bus_addresses(&response.devices),
            HashSet::from(["0000:17:00.0", "0000:18:00.0"])
        );
        let device = &response.devices[0];
        assert_eq!(device.card_name, TEST_CARD_NAME);
        assert_eq!(device.profile_name, PASSTHROUGH_PROFILE_NAME);
        assert_eq!(device.vendor_id, TEST_VENDOR_ID);
        assert_eq!(device.hardware_device_id, TEST_HARDWARE_DEVICE_ID);

        // With A and B taken the next pair comes from numa1/root2.
        let response = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-2"), profile_id, 2)
            .await?;
        assert_eq!(response.tier, PackingTier::SameNumaSameRoot);
        assert_eq!(
            bus_addresses(&response.devices),
            HashSet::from(["0000:86:00.0", "0000:87:00.0"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_allocation_spills_across_numa_nodes() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;

        let response = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 3)
            .await?;
        assert_eq!(response.tier, PackingTier::SameNuma);
        assert_eq!(
            bus_addresses(&response.devices),
            HashSet::from(["0000:17:00.0", "0000:18:00.0", "0000:3b:00.0"])
        );

        // No single node holds four devices: the smaller node is drained
        // first, then the fuller root of the larger one.
        engine.allocator.release(&VmId::from("vm-1")).await?;
        let response = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-2"), profile_id, 4)
            .await?;
        assert_eq!(response.tier, PackingTier::Scattered);
        assert_eq!(
            bus_addresses(&response.devices),
            HashSet::from(["0000:86:00.0", "0000:87:00.0", "0000:17:00.0", "0000:18:00.0"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_allocation_conserves_capacity() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let free_before = engine.free_passthrough()?;
        let vm_id = VmId::from("vm-1");

        let response = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 3)
            .await?;
        assert_eq!(engine.free_passthrough()?, free_before - 3);
        let capacity = response.capacity.get(TEST_CARD_NAME, PASSTHROUGH_PROFILE_NAME);
        assert_eq!(capacity.free, free_before - 3);
        assert_eq!(capacity.total, 5);

        let claimed: HashSet<GpuDeviceId> = response.devices.iter().map(|d| d.id).collect();
        for device in engine.devices()? {
            if claimed.contains(&device.id) {
                assert_eq!(device.state, DeviceState::Allocated);
                assert_eq!(device.vm_id.as_ref(), Some(&vm_id));
            } else {
                assert_eq!(device.state, DeviceState::Free);
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_release_restores_devices() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let before = engine.devices()?;
        let vm_id = VmId::from("vm-1");

        let response = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 2)
            .await?;
        let mut released = engine.allocator.release(&vm_id).await?;
        released.sort();
        let mut claimed: Vec<GpuDeviceId> = response.devices.iter().map(|d| d.id).collect();
        claimed.sort();
        assert_eq!(released, claimed);
        assert_eq!(engine.devices()?, before);

        // Nothing left to release.
        assert!(engine.allocator.release(&vm_id).await?.is_empty());
        assert!(engine
            .allocator
            .release(&VmId::from("never-allocated"))
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_spans_hosts() -> Result<()> {
        let engine = TestEngine::new().await?;
        let other_host = HostId::from("kvm-02");
        engine.store.upsert_host(other_host.get()).await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        engine.reconciler.reconcile(&other_host, &topology_facts()).await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let vm_id = VmId::from("vm-1");
        engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 1)
            .await?;
        engine.allocator.allocate(&other_host, &vm_id, profile_id, 2).await?;

        assert_eq!(engine.allocator.release(&vm_id).await?.len(), 3);
        let reader = engine.store.inventory_state.reader();
        assert!(reader.devices_for_vm(&vm_id)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_allocation_is_reentrant_per_vm() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let vm_id = VmId::from("vm-1");

        let first = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 2)
            .await?;
        let retry = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 2)
            .await?;
        assert_eq!(bus_addresses(&first.devices), bus_addresses(&retry.devices));
        let reader = engine.store.inventory_state.reader();
        assert_eq!(reader.devices_for_vm(&vm_id)?.len(), 2);
        assert_eq!(engine.free_passthrough()?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_insufficient_capacity_leaves_no_partial_claim() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let vm_id = VmId::from("vm-1");
        engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 1)
            .await?;
        let before = engine.devices()?;

        let err = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 6)
            .await
            .unwrap_err();
        match err {
            InventoryError::InsufficientCapacity {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 6);
                // The VM's own device counts while the release is pending.
                assert_eq!(available, 5);
            }
            other => anyhow::bail!("unexpected error {:?}", other),
        }
        // The re-entrant release was rolled back together with the rest.
        assert_eq!(engine.devices()?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_allocation_rejects_bad_requests() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let vm_id = VmId::from("vm-1");

        let err = engine
            .allocator
            .allocate(&engine.host(), &vm_id, profile_id, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidArgument(_)));

        let err = engine
            .allocator
            .allocate(&HostId::from("unknown-host"), &vm_id, profile_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { kind: "host", .. }));

        let err = engine
            .allocator
            .allocate(&engine.host(), &vm_id, VgpuProfileId(404), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { kind: "vgpu profile", .. }));

        // A profile whose card has no device on the host.
        let UpdateOutcome::Card(other_card) = engine
            .store
            .inventory_state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::CreateGpuCard(CreateGpuCardRequest {
                    vendor_id: TEST_VENDOR_ID.to_string(),
                    device_id: "2330".to_string(),
                    vendor_name: "NVIDIA Corporation".to_string(),
                    device_name: "GH100".to_string(),
                    name: "NVIDIA H100 80GB".to_string(),
                }),
            })
            .await?
        else {
            anyhow::bail!("expected a card");
        };
        let other_profile = engine
            .store
            .inventory_state
            .reader()
            .profiles_for_card(other_card.id)?[0]
            .id;
        let err = engine
            .allocator
            .allocate(&engine.host(), &vm_id, other_profile, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { .. }));

        let err = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("bad|vm"), profile_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidArgument(_)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_overlap() -> Result<()> {
        let engine = TestEngine::new().await?;
        let facts: Vec<DeviceFact> = (0..8)
            .map(|i| {
                mock_passthrough_fact(
                    &format!("0000:{:02x}:00.0", 0x17 + i),
                    &(i % 2).to_string(),
                    &format!("pci0000:{}", i % 4),
                )
            })
            .collect();
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;

        let mut handles = Vec::new();
        for i in 0..6 {
            let allocator = engine.allocator.clone();
            let host = engine.host();
            handles.push(tokio::spawn(async move {
                allocator
                    .allocate(&host, &VmId::new(format!("vm-{}", i)), profile_id, 2)
                    .await
            }));
        }

        let mut claimed = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await? {
                Ok(response) => claimed.extend(response.devices.iter().map(|d| d.id)),
                Err(InventoryError::InsufficientCapacity { .. }) => rejected += 1,
                Err(err) => return Err(err.into()),
            }
        }
        let unique: HashSet<GpuDeviceId> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), claimed.len());
        assert_eq!(claimed.len(), 8);
        assert_eq!(rejected, 2);
        assert_eq!(engine.free_passthrough()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_disable_is_blocked_while_in_use() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let response = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 1)
            .await?;
        let bound = response.devices[0].id;
        let free = engine
            .devices()?
            .into_iter()
            .find(|d| d.vm_id.is_none())
            .map(|d| d.id)
            .ok_or_else(|| anyhow::anyhow!("no free device"))?;

        let err = engine
            .resource_state
            .set_resource_state(&[free, bound], ResourceState::Disabled)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InUse(_)));
        let reader = engine.store.inventory_state.reader();
        assert_eq!(reader.require_device(bound)?.resource_state, ResourceState::Enabled);
        // The whole batch is rejected.
        assert_eq!(reader.require_device(free)?.resource_state, ResourceState::Enabled);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_devices_are_not_allocated() -> Result<()> {
        let engine = TestEngine::new().await?;
        engine
            .reconciler
            .reconcile(&engine.host(), &topology_facts())
            .await?;
        let profile_id = engine.profile_id(PASSTHROUGH_PROFILE_NAME)?;
        let ids: Vec<GpuDeviceId> = engine.devices()?.iter().map(|d| d.id).collect();

        let updated = engine
            .resource_state
            .set_resource_state(&ids[..4], ResourceState::Disabled)
            .await?;
        assert!(updated.iter().all(|d| d.resource_state == ResourceState::Disabled));
        assert_eq!(engine.free_passthrough()?, 1);
        let err = engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientCapacity { available: 1, .. }));

        // Already disabled devices are accepted as a no-op.
        engine
            .resource_state
            .set_resource_state(&ids[..2], ResourceState::Disabled)
            .await?;
        engine
            .resource_state
            .set_resource_state(&ids, ResourceState::Enabled)
            .await?;
        engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), profile_id, 2)
            .await?;

        let err = engine
            .resource_state
            .set_resource_state(&[GpuDeviceId(404)], ResourceState::Enabled)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { kind: "gpu device", .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_capacity_snapshot_groups_by_card_and_profile() -> Result<()> {
        let engine = TestEngine::new().await?;
        let mut facts = topology_facts();
        facts.push(mock_vgpu_fact("mdev-0001", "0000:86:00.0", TEST_VGPU_PROFILE, "1", "pci0000:85"));
        facts.push(mock_vgpu_fact("mdev-0002", "0000:86:00.0", TEST_VGPU_PROFILE, "1", "pci0000:85"));
        engine.reconciler.reconcile(&engine.host(), &facts).await?;
        let vgpu_profile = engine.profile_id(TEST_VGPU_PROFILE)?;
        engine
            .allocator
            .allocate(&engine.host(), &VmId::from("vm-1"), vgpu_profile, 1)
            .await?;
        let disabled = engine.device_at("0000:3b:00.0")?;
        engine
            .resource_state
            .set_resource_state(&[disabled.id], ResourceState::Disabled)
            .await?;

        let capacity = engine.capacity.capacity_snapshot(&engine.host())?;
        let passthrough = capacity.get(TEST_CARD_NAME, PASSTHROUGH_PROFILE_NAME);
        assert_eq!((passthrough.free, passthrough.total), (4, 5));
        let vgpu = capacity.get(TEST_CARD_NAME, TEST_VGPU_PROFILE);
        assert_eq!((vgpu.free, vgpu.total), (1, 2));
        assert_eq!(capacity.entries().len(), 2);

        let err = engine
            .capacity
            .capacity_snapshot(&HostId::from("unknown-host"))
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { kind: "host", .. }));
        Ok(())
    }
}
