use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fusion_core::{
    AssociatedDetection, BeliefLatticeContext, ClassProbs, DetectedObject, FusionConfig, Geometry,
    ObjectClass, SensorFrame, SensorType, TrackId, TrackIdAllocator, TrackManager,
};

fn ring(n: usize) -> Vec<DetectedObject> {
    (0..n)
        .map(|i| {
            let angle = i as f64 * std::f64::consts::TAU / n as f64;
            let r = 100.0_f64;
            let class = ObjectClass::ALL[i % 4];
            DetectedObject::new(Geometry::at(r * angle.cos(), r * angle.sin()), ClassProbs::certain(class))
        })
        .collect()
}

/// Lidar frame matching every object to the track born from it in the warm-up cycle.
fn matched_frame(sensor_type: SensorType, sensor_id: &str, t: f64, objects: &[DetectedObject]) -> SensorFrame {
    objects.iter().enumerate().fold(SensorFrame::new(sensor_type, sensor_id, t), |frame, (i, obj)| {
        frame.with(AssociatedDetection::matched(obj.clone(), TrackId(i as u64), 0.1))
    })
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");

    for n in [50, 500, 1000] {
        let objects = ring(n);
        group.bench_function(format!("{n}_tracks"), |b| {
            b.iter(|| {
                let mut manager = TrackManager::new(
                    FusionConfig::default(),
                    BeliefLatticeContext::initialized_object_classes(),
                    TrackIdAllocator::default(),
                )
                .unwrap();
                // Warm up with one frame to create tracks
                let births = objects
                    .iter()
                    .fold(SensorFrame::new(SensorType::Lidar, "lidar_top", 0.0), |frame, obj| {
                        frame.with(AssociatedDetection::unmatched(obj.clone()))
                    });
                manager.process_cycle(0.0, vec![births]).unwrap();
                // Measure a three-sensor cycle over established tracks
                let frames = vec![
                    matched_frame(SensorType::Lidar, "lidar_top", 0.1, &objects),
                    matched_frame(SensorType::Radar, "radar_front", 0.08, &objects),
                    SensorFrame::new(SensorType::Camera, "camera_front", 0.09),
                ];
                black_box(manager.process_cycle(0.1, frames).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cycle);
criterion_main!(benches);
