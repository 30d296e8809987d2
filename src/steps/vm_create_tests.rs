use super::*;
use crate::engine::Artifacts;
use crate::host::testing::FakeHost;
use crate::host::Distro;
use crate::libvirt::xml::Element;
use crate::libvirt::Hypervisor;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;

type StepFn = fn(&StepContext<'_>) -> Result<StepOutput>;

fn cpuinfo(sockets: u32, cores: u32, threads: u32) -> String {
    let mut text = String::new();
    let mut processor = 0;
    for socket in 0..sockets {
        for _ in 0..cores * threads {
            text.push_str(&format!(
                "processor\t: {processor}\nvendor_id\t: AuthenticAMD\nphysical id\t: {socket}\n\
                 siblings\t: {}\ncpu cores\t: {cores}\n\n",
                cores * threads
            ));
            processor += 1;
        }
    }
    text
}

fn answers(extra: Value) -> Value {
    let mut base = json!({
        "windows_iso": "/isos/win11.iso",
        "vm.name": "Gaming",
        "vm.memory_mib": 8192,
        "vm.disk_gib": 1,
        "vnc_password": "hunter2",
    });
    if let (Some(base), Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

fn write_pci(fake: &FakeHost, address: &str, class: &str, vendor: &str, device: &str) {
    let base = format!("/sys/bus/pci/devices/{address}");
    fake.write(&format!("{base}/class"), &format!("{class}\n"));
    fake.write(&format!("{base}/vendor"), &format!("{vendor}\n"));
    fake.write(&format!("{base}/device"), &format!("{device}\n"));
}

fn fake_host(distro: Distro, extra: Value) -> FakeHost {
    let fake = FakeHost::with_answers(distro, answers(extra));
    fake.write("/proc/cpuinfo", &cpuinfo(1, 8, 2));
    fake.write("/proc/meminfo", "MemTotal:       32768000 kB\n");
    fake.write("/isos/win11.iso", "not really an iso");
    fake.mkdir("/var/lib/libvirt/images");
    write_pci(&fake, "0000:00:02.0", "0x060000", "0x8086", "0x1234");
    write_pci(&fake, "0000:01:00.0", "0x030000", "0x10de", "0x2484");
    write_pci(&fake, "0000:01:00.1", "0x040300", "0x10de", "0x228b");
    fake
}

fn run(step: StepFn, fake: &FakeHost, artifacts: &Artifacts) -> Result<StepOutput> {
    step(&StepContext {
        phase: Phase::VmCreate,
        step: "test",
        artifacts,
        host: &fake.host,
    })
}

/// Run every step in order the way the engine would, checking declared artifacts.
fn run_all(fake: &FakeHost) -> Artifacts {
    let mut artifacts = Artifacts::new();
    for step in steps() {
        for key in step.required_artifacts() {
            assert!(artifacts.contains_key(*key), "{} needs {key}", step.name());
        }
        let output = step
            .execute(&StepContext {
                phase: Phase::VmCreate,
                step: step.name(),
                artifacts: &artifacts,
                host: &fake.host,
            })
            .unwrap_or_else(|err| panic!("{} failed: {err:#}", step.name()));
        for key in step.produced_artifacts() {
            assert!(output.artifacts.contains_key(*key), "{} produces {key}", step.name());
        }
        artifacts.extend(output.artifacts);
    }
    artifacts
}

fn installed(fake: &FakeHost) -> Artifacts {
    let mut artifacts = Artifacts::new();
    artifacts.insert("windows_iso".to_string(), json!("/isos/win11.iso"));
    artifacts.insert(
        "vm_config".to_string(),
        json!({
            "name": "Gaming",
            "memory_mib": 8192,
            "disk_gib": 64,
            "sockets": 1,
            "cores": 7,
            "threads": 2,
        }),
    );
    let output = run(create_vm, fake, &artifacts).expect("create");
    artifacts.extend(output.artifacts);
    artifacts
}

#[test]
fn whole_phase_leaves_a_passthrough_ready_definition() {
    let fake = fake_host(Distro::Ubuntu, json!({}));
    let artifacts = run_all(&fake);

    assert_eq!(artifacts["domain"], "Gaming");
    assert_eq!(artifacts["main_disk"], "/var/lib/libvirt/images/Gaming.qcow2");
    assert_eq!(artifacts["vm_config"]["cores"], 7);
    assert_eq!(artifacts["vm_config"]["threads"], 2);
    assert_eq!(artifacts["gpu_devices"].as_array().map(Vec::len), Some(2));
    assert_eq!(artifacts["detached_disks"].as_array().map(Vec::len), Some(3));

    let xml = fake.hypervisor.domain_xml("Gaming").expect("definition");
    let domain = Element::parse(&xml).expect("parse");
    let disks = edits::disks(&domain).expect("disks");
    assert_eq!(disks.len(), 1);
    assert_eq!(
        disks[0].source.as_deref(),
        Some("/var/lib/libvirt/images/Gaming.qcow2")
    );
    assert_eq!(disks[0].bus.as_deref(), Some("virtio"));
    assert!(!xml.contains("spice"), "{xml}");
    assert!(xml.contains("type=\"vnc\""));
    let devices = domain.child("devices").expect("devices");
    assert_eq!(devices.children_named("hostdev").count(), 2);
    assert!(!fake.hypervisor.is_running("Gaming").expect("state"));

    let commands = fake.runner.commands();
    assert!(commands.contains(
        &"qemu-img create -f qcow2 /var/lib/libvirt/images/Gaming_virtio1.qcow2 100M".to_string()
    ));
    assert!(commands.contains(&"systemctl enable --now ssh".to_string()));
    assert!(commands.contains(&"systemctl restart libvirtd".to_string()));
    assert!(fake
        .path("/etc/libvirt/hooks/qemu.d/Gaming/prepare/begin/start.sh")
        .is_file());

    let mode = fs::metadata(fake.path("/isos"))
        .expect("stat iso dir")
        .permissions()
        .mode();
    assert_eq!(mode & 0o001, 0o001, "qemu can traverse the ISO directory");
}

#[test]
fn missing_windows_iso_points_at_the_download_page() {
    let fake = fake_host(Distro::Ubuntu, json!({"have_windows_iso": false}));
    let err = run(select_install_media, &fake, &Artifacts::new()).expect_err("no iso");
    assert!(err.to_string().contains("microsoft.com"), "{err}");
}

#[test]
fn iso_path_must_exist_on_the_host() {
    let fake = fake_host(Distro::Ubuntu, json!({"windows_iso": "/isos/missing.iso"}));
    let err = run(select_install_media, &fake, &Artifacts::new()).expect_err("missing");
    assert!(format!("{err:#}").contains("does not exist"), "{err:#}");
}

#[test]
fn memory_is_bounded_by_the_host_total() {
    let fake = fake_host(Distro::Ubuntu, json!({"vm.memory_mib": 64000}));
    let err = run(configure_vm, &fake, &Artifacts::new()).expect_err("too much memory");
    let text = format!("{err:#}");
    assert!(text.contains("answer for `vm.memory_mib`"), "{text}");
    assert!(text.contains("between 1024 and 32000"), "{text}");
}

#[test]
fn vm_names_are_restricted_to_safe_characters() {
    assert_eq!(parse_vm_name("Windows_VM-2").expect("valid"), "Windows_VM-2");
    assert!(parse_vm_name("../etc").is_err());
    assert!(parse_vm_name("my vm").is_err());
    assert!(parse_vm_name("").is_err());
}

#[test]
fn arch_hosts_start_libvirt_before_creating_the_vm() {
    let fake = fake_host(Distro::Arch, json!({}));
    fake.runner.fail(
        "virsh --connect qemu:///system net-start",
        "network is already active",
    );
    let artifacts = installed(&fake);
    assert_eq!(artifacts["domain"], "Gaming");
    assert_eq!(
        fake.runner.commands(),
        vec![
            "systemctl enable --now libvirtd",
            "virsh --connect qemu:///system net-start default",
            "virsh --connect qemu:///system net-autostart default",
        ]
    );
    assert!(!fake.hypervisor.is_running("Gaming").expect("state"));
}

#[test]
fn an_existing_domain_is_never_overwritten() {
    let fake = fake_host(Distro::Fedora, json!({}));
    let artifacts = installed(&fake);
    let err = run(create_vm, &fake, &artifacts).expect_err("duplicate");
    assert!(err.to_string().contains("already exists"), "{err}");
}

#[test]
fn driver_media_step_waits_for_the_windows_install() {
    let fake = fake_host(Distro::Fedora, json!({"windows_installed": false}));
    let artifacts = installed(&fake);
    let err = run(attach_driver_media, &fake, &artifacts).expect_err("not installed");
    assert!(err.to_string().contains("vmprep resume"), "{err}");

    // The media stays attached, and attaching again changes nothing.
    let before = fake.hypervisor.domain_xml("Gaming").expect("xml");
    assert!(before.contains("virtio-win.iso"));
    assert!(run(attach_driver_media, &fake, &artifacts).is_err());
    assert_eq!(fake.hypervisor.domain_xml("Gaming").expect("xml"), before);
}

#[test]
fn operator_can_supply_the_driver_iso_instead_of_downloading() {
    let fake = fake_host(
        Distro::Fedora,
        json!({"download_virtio_iso": false, "virtio_iso": "/isos/virtio-win-0.1.262.iso"}),
    );
    fake.write("/isos/virtio-win-0.1.262.iso", "drivers");
    let artifacts = installed(&fake);
    let output = run(attach_driver_media, &fake, &artifacts).expect("attach");
    assert_eq!(
        output.artifacts["driver_iso"]["iso"],
        "/isos/virtio-win-0.1.262.iso"
    );
    assert_eq!(output.artifacts["driver_iso"]["iso_target"], "sdc");
    assert_eq!(output.artifacts["driver_iso"]["scratch_target"], "vda");
}

#[test]
fn second_gpu_can_be_chosen() {
    let fake = fake_host(Distro::Fedora, json!({"gpu": 2}));
    write_pci(&fake, "0000:0b:00.0", "0x030000", "0x1002", "0x73bf");
    let artifacts = installed(&fake);
    let output = run(attach_gpu, &fake, &artifacts).expect("attach");
    assert_eq!(output.artifacts["gpu_devices"][0]["address"], "0000:0b:00.0");
    assert_eq!(output.artifacts["gpu_devices"].as_array().map(Vec::len), Some(1));
}

#[test]
fn no_gpu_is_an_error() {
    let fake = FakeHost::new(Distro::Fedora);
    let mut artifacts = Artifacts::new();
    artifacts.insert("domain".to_string(), json!("Gaming"));
    let err = run(attach_gpu, &fake, &artifacts).expect_err("no gpu");
    assert!(err.to_string().contains("no display controller"), "{err}");
}
