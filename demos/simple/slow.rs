// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#[inline(never)]
#[allow(deprecated)]
fn accidentally_slow() {
    std::thread::sleep_ms(10);
    std::hint::black_box(0);
}

#[inline(never)]
fn short_sleep() {
    std::thread::sleep(std::time::Duration::from_micros(100));
    std::hint::black_box(0);
}

#[inline(never)]
fn allocate_some() -> usize {
    let buf = vec![1u8; 64 * 1024];
    std::hint::black_box(buf).len()
}

pub async fn run() {
    let mut ts: Vec<tokio::task::JoinHandle<()>> = vec![];
    for _ in 0..8 {
        ts.push(tokio::task::spawn(async move {
            loop {
                tokio::task::yield_now().await;
                // most time goes to `short_sleep`, with the odd long poll
                if rand::random::<f64>() < 0.002 {
                    accidentally_slow();
                } else {
                    short_sleep();
                }
                allocate_some();
            }
        }));
    }
    for t in ts {
        t.await.ok();
    }
}
