// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example: open an accelerator port, inspect the handle, close it.
//!
//! Run with: `cargo run --example basic -- [devpath] [sysfspath]`

use fpga_access::{Handle, ObjectType, OpenFlags, ResultCode, Token};

fn main() {
    let mut args = std::env::args().skip(1);
    let devpath = args
        .next()
        .unwrap_or_else(|| "/dev/intel-fpga-port.0".to_string());
    let sysfspath = args
        .next()
        .unwrap_or_else(|| "/sys/class/fpga/intel-fpga-dev.0/intel-fpga-port.0".to_string());

    println!("FPGA Handle Basic Example");
    println!("=========================\n");

    let token = Token::new(ObjectType::Accelerator, 0, devpath, sysfspath);
    println!("Token: {}", token);
    println!();

    // Exclusive open
    println!("Opening handle...");
    let handle = match Handle::open(&token, OpenFlags::empty()) {
        Ok(handle) => handle,
        Err(e) => {
            println!("  Failed to open: {} ({})", e, e.code());
            return;
        }
    };
    println!("  Handle:   {}", handle.id());
    println!("  Mode:     {:?}", handle.access_mode());
    if let Ok(fd) = handle.device_fd() {
        println!("  Fd:       {}", fd.as_raw());
    }
    match handle.lock() {
        Ok(guard) => match guard.numa_snapshot() {
            Some(snapshot) => println!(
                "  NUMA:     device on node {}, caller bound to {}",
                snapshot.device_node(),
                snapshot.at_open().membind
            ),
            None => println!("  NUMA:     no snapshot"),
        },
        Err(e) => println!("  Lock failed: {}", e),
    }
    println!();

    // A second exclusive open of the same port is refused
    println!("Opening a second exclusive handle...");
    match Handle::open(&token, OpenFlags::empty()) {
        Ok(second) => {
            println!("  Unexpectedly succeeded, closing it again");
            let _ = second.close();
        }
        Err(e) if e.code() == ResultCode::Busy => println!("  Busy, as expected"),
        Err(e) => println!("  Failed: {}", e),
    }
    println!();

    println!("Closing handle...");
    match handle.close() {
        Ok(report) if report.is_clean() => println!("  Closed cleanly"),
        Ok(report) => {
            for failure in &report.failures {
                println!("  Release failure: {}", failure);
            }
        }
        Err(e) => println!("  Close failed: {}", e),
    }

    println!("\nDone!");
}
