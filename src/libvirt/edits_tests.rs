use super::*;

const DOMAIN: &str = r#"<domain type='kvm'>
  <name>Gaming</name>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/Gaming.qcow2'/>
      <target dev='sda' bus='sata'/>
      <address type='drive' controller='0' bus='0' target='0' unit='0'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/isos/win11.iso'/>
      <target dev='sdb' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='default'/>
    </interface>
    <channel type='spicevmc'>
      <target type='virtio' name='com.redhat.spice.0'/>
    </channel>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='spice' autoport='yes'>
      <listen type='address'/>
      <image compression='off'/>
    </graphics>
    <audio id='1' type='spice'/>
    <video>
      <model type='qxl'/>
    </video>
    <redirdev bus='usb' type='spicevmc'/>
    <redirdev bus='usb' type='spicevmc'/>
  </devices>
</domain>
"#;

const MAIN_DISK: &str = "/var/lib/libvirt/images/Gaming.qcow2";

fn domain() -> Element {
    Element::parse(DOMAIN).expect("parse domain")
}

fn gpu(address: &str) -> PciDevice {
    PciDevice {
        address: address.to_string(),
        class: "0x030000".to_string(),
        vendor: "0x1002".to_string(),
        device: "0x73bf".to_string(),
    }
}

#[test]
fn domain_name_and_disks_are_listed() {
    let domain = domain();
    assert_eq!(domain_name(&domain).as_deref(), Some("Gaming"));
    let disks = disks(&domain).expect("disks");
    assert_eq!(disks.len(), 2);
    assert_eq!(disks[0].target, "sda");
    assert_eq!(disks[1].device, "cdrom");
    assert_eq!(disks[1].source.as_deref(), Some("/isos/win11.iso"));
}

#[test]
fn free_target_skips_used_letters() {
    let used: BTreeSet<String> = ["sda", "sdb", "sdc"].map(str::to_string).into();
    assert_eq!(free_target(&used, "sd", 'c').as_deref(), Some("sdd"));
    assert_eq!(free_target(&used, "vd", 'a').as_deref(), Some("vda"));
}

#[test]
fn sata_system_disk_moves_to_virtio_without_drive_address() {
    let mut domain = domain();
    let changed = sata_disks_to_virtio(&mut domain).expect("edit");
    assert_eq!(changed, vec![("sda".to_string(), "vda".to_string())]);

    let disks = disks(&domain).expect("disks");
    assert_eq!(disks[0].target, "vda");
    assert_eq!(disks[0].bus.as_deref(), Some("virtio"));
    assert_eq!(disks[1].bus.as_deref(), Some("sata"), "cdrom stays on sata");
    let main = domain
        .child("devices")
        .and_then(|devices| devices.child("disk"))
        .expect("main disk");
    assert!(main.child("address").is_none());

    assert!(sata_disks_to_virtio(&mut domain).expect("again").is_empty());
}

#[test]
fn spice_display_becomes_vnc_and_spice_devices_go_away() {
    let mut domain = domain();
    let change = spice_to_vnc(&mut domain, "0.0.0.0", "hunter2").expect("edit");
    assert_eq!(change.removed_spice_devices, 4);
    assert!(!change.password_truncated);

    let xml = domain.to_xml().expect("serialize");
    assert!(!xml.contains("spice"), "{xml}");
    assert!(xml.contains("org.qemu.guest_agent.0"));
    let devices = domain.child("devices").expect("devices");
    let graphics: Vec<_> = devices.children_named("graphics").collect();
    assert_eq!(graphics.len(), 1);
    assert_eq!(graphics[0].attr("type"), Some("vnc"));
    assert_eq!(graphics[0].attr("port"), Some("-1"));
    assert_eq!(graphics[0].attr("passwd"), Some("hunter2"));
    assert_eq!(
        graphics[0].child("listen").and_then(|listen| listen.attr("address")),
        Some("0.0.0.0")
    );
    assert!(graphics[0].child("image").is_none());
}

#[test]
fn vnc_conversion_is_idempotent_and_truncates_long_passwords() {
    let mut domain = domain();
    let change = spice_to_vnc(&mut domain, "0.0.0.0", "correcthorse").expect("edit");
    assert!(change.password_truncated);
    let once = domain.clone();
    let again = spice_to_vnc(&mut domain, "0.0.0.0", "correcthorse").expect("again");
    assert_eq!(again.removed_spice_devices, 0);
    assert_eq!(domain, once);
    let graphics = domain
        .child("devices")
        .and_then(|devices| devices.child("graphics"))
        .expect("graphics");
    assert_eq!(graphics.attr("passwd"), Some("correct"));

    assert!(spice_to_vnc(&mut domain, "0.0.0.0", "").is_err());
}

#[test]
fn hostdevs_are_added_once_per_function() {
    let mut domain = domain();
    let functions = [gpu("0000:0b:00.0"), gpu("0000:0b:00.1")];
    assert_eq!(add_hostdevs(&mut domain, &functions).expect("add"), 2);
    assert_eq!(add_hostdevs(&mut domain, &functions).expect("again"), 0);

    let devices = domain.child("devices").expect("devices");
    let hostdev = devices.children_named("hostdev").next().expect("hostdev");
    assert_eq!(hostdev.attr("managed"), Some("yes"));
    let address = hostdev
        .child("source")
        .and_then(|source| source.child("address"))
        .expect("address");
    assert_eq!(address.attr("bus"), Some("0x0b"));
    assert_eq!(address.attr("function"), Some("0x0"));
}

#[test]
fn driver_media_lands_on_free_targets_next_to_other_disks() {
    let mut domain = domain();
    let scratch = DiskSpec {
        device: DiskDevice::Disk,
        source: "/var/lib/libvirt/images/Gaming_virtio1.qcow2".to_string(),
        bus: "virtio",
        format: "qcow2",
    };
    let iso = DiskSpec {
        device: DiskDevice::Cdrom,
        source: "/var/lib/libvirt/images/virtio-win.iso".to_string(),
        bus: "sata",
        format: "raw",
    };
    assert_eq!(add_disk(&mut domain, &scratch).expect("scratch"), "vda");
    assert_eq!(add_disk(&mut domain, &iso).expect("iso"), "sdc");
    assert_eq!(add_disk(&mut domain, &iso).expect("iso again"), "sdc");

    let names: Vec<_> = domain
        .child("devices")
        .expect("devices")
        .elements()
        .map(|element| element.name.as_str())
        .collect();
    assert_eq!(&names[..5], ["emulator", "disk", "disk", "disk", "disk"]);
    let listed = disks(&domain).expect("disks");
    assert_eq!(listed.len(), 4);
    assert_eq!(listed[3].device, "cdrom");
}

#[test]
fn cleanup_keeps_only_the_main_disk() {
    let mut domain = domain();
    let removed = remove_disks_except(&mut domain, MAIN_DISK).expect("cleanup");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].target, "sdb");
    let remaining = disks(&domain).expect("disks");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].source.as_deref(), Some(MAIN_DISK));

    assert!(remove_disks_except(&mut domain, MAIN_DISK).expect("again").is_empty());
    assert!(remove_disks_except(&mut domain, "/elsewhere.qcow2").is_err());
}

#[test]
fn relocation_rewrites_only_the_matching_disk() {
    let mut domain = Element::parse(DOMAIN).expect("parse");
    let updated = relocate_disk(&mut domain, MAIN_DISK, "/mnt/fast/Gaming.qcow2").expect("relocate");
    assert_eq!(updated, 1);
    let xml = domain.to_xml().expect("serialize");
    assert!(xml.contains("/mnt/fast/Gaming.qcow2"));
    assert!(xml.contains("/isos/win11.iso"));
    assert!(!xml.contains(MAIN_DISK));
}
