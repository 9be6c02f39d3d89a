use std::io::Write;
use std::process::Command;

/// Boot sector that prints "OK" over COM1 and halts.
fn serial_ok_sector() -> Vec<u8> {
    let mut image = vec![0u8; 512];
    let code: [u8; 11] = [
        0xBA, 0xF8, 0x03, // mov dx, 0x3F8
        0xB0, b'O', // mov al, 'O'
        0xEE, // out dx, al
        0xB0, b'K', // mov al, 'K'
        0xEE, // out dx, al
        0xFA, 0xF4, // cli; hlt
    ];
    image[..code.len()].copy_from_slice(&code);
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

#[test]
fn boots_a_sector_image_and_prints_serial_output() {
    let mut file = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
    file.write_all(&serial_ok_sector()).unwrap();
    file.flush().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_machina"))
        .arg(file.path())
        .arg("--max-instructions")
        .arg("100000")
        .output()
        .expect("failed to run the machina binary");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "exit: {:?}\nstdout: {stdout}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("OK"), "missing serial output: {stdout}");
}

#[test]
fn rejects_a_missing_image_path() {
    let output = Command::new(env!("CARGO_BIN_EXE_machina"))
        .arg("/nonexistent/machina-test.img")
        .output()
        .expect("failed to run the machina binary");
    assert!(!output.status.success());
}
