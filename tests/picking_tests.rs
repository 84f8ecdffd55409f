//! Picking and ray query tests.

mod common;

use rstest::rstest;

use common::TestContext;
use forward_renderer::prelude::*;
use forward_renderer::scene::NodeId;

fn instance_of(ctx: &TestContext, node: NodeId) -> forward_renderer::pipeline::InstanceId {
    ctx.scene
        .component::<MeshRenderer>(node)
        .map(MeshRenderer::instance_id)
        .unwrap()
}

// ============================================================================
// Picking Tests
// ============================================================================

#[rstest]
#[case::center(16, 16, true)]
#[case::corner(0, 0, false)]
fn test_pick_cube(#[case] x: u32, #[case] y: u32, #[case] hit: bool) {
    let mut ctx = TestContext::new(32, 32);
    let material = ctx.add_material(Material::default());
    let cube = ctx.add_cube("cube", Vec3::ZERO, material);

    let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    let picked = ctx
        .renderer
        .pick_instance_at(&mut ctx.scene, &ctx.store, &mut camera, x, y)
        .unwrap();
    assert_eq!(picked, hit.then(|| instance_of(&ctx, cube)));
    assert_eq!(ctx.renderer.backend().render_target(), RenderTarget::Screen);
}

/// The nearer of two overlapping cubes wins.
#[test]
fn test_pick_nearest() {
    let mut ctx = TestContext::new(32, 32);
    let material = ctx.add_material(Material::default());
    ctx.add_cube("far", Vec3::new(0.0, 0.0, -3.0), material);
    let near = ctx.add_cube("near", Vec3::ZERO, material);

    let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    let picked = ctx
        .renderer
        .pick_instance_at(&mut ctx.scene, &ctx.store, &mut camera, 16, 16)
        .unwrap();
    assert_eq!(picked, Some(instance_of(&ctx, near)));
}

#[test]
fn test_pick_scaled_target() {
    let config = RendererConfig::default().with_picking_resolution_scale(2);
    let mut ctx = TestContext::with_config(16, 16, config);
    let material = ctx.add_material(Material::default());
    let cube = ctx.add_cube("cube", Vec3::ZERO, material);

    let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    let picked = ctx
        .renderer
        .pick_instance_at(&mut ctx.scene, &ctx.store, &mut camera, 8, 8)
        .unwrap();
    assert_eq!(picked, Some(instance_of(&ctx, cube)));
    assert_eq!(ctx.renderer.last_stats().picking_draws, 1);
}

#[test]
fn test_pick_outside_camera_viewport() {
    let mut ctx = TestContext::new(32, 32);
    let material = ctx.add_material(Material::default());
    ctx.add_cube("cube", Vec3::ZERO, material);

    let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO)
        .with_viewport(Vec4::new(0.0, 0.0, 0.25, 0.25));
    let picked = ctx
        .renderer
        .pick_instance_at(&mut ctx.scene, &ctx.store, &mut camera, 20, 20)
        .unwrap();
    assert_eq!(picked, None);
}

// ============================================================================
// Raycast Tests
// ============================================================================

#[test]
fn test_raycast_sorted_by_distance() {
    let mut ctx = TestContext::new(16, 16);
    let material = ctx.add_material(Material::default());
    let far = ctx.add_cube("far", Vec3::new(0.0, 0.0, -4.0), material);
    let near = ctx.add_cube("near", Vec3::ZERO, material);
    ctx.add_camera(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    ctx.render(&RenderOptions::default());

    let hits = ctx.renderer.raycast(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 100.0);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].instance, instance_of(&ctx, near));
    assert_eq!(hits[0].node, Some(near));
    assert!((hits[0].distance - 4.5).abs() < 1e-4);
    assert!((hits[0].point.z - 0.5).abs() < 1e-4);
    assert_eq!(hits[1].instance, instance_of(&ctx, far));

    let short = ctx.renderer.raycast(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 5.0);
    assert_eq!(short.len(), 1);
}

#[test]
fn test_raycast_skips_opted_out_instances() {
    let mut ctx = TestContext::new(16, 16);
    let material = ctx.add_material(Material::default());
    let cube = ctx.cube;
    let flags = RenderFlags {
        raycastable: false,
        ..RenderFlags::default()
    };
    ctx.scene.spawn(
        "ghost",
        Transform::default(),
        MeshRenderer::new(cube, material).with_flags(flags),
    );
    ctx.add_camera(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    ctx.render(&RenderOptions::default());

    assert!(ctx
        .renderer
        .raycast(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 100.0)
        .is_empty());
}

#[test]
fn test_raycast_colliders() {
    let mut ctx = TestContext::new(16, 16);
    let sphere = ctx.scene.spawn(
        "sphere",
        Transform::from_position(Vec3::new(0.0, 0.0, -2.0)),
        ColliderComponent::sphere(1.0),
    );
    let boxed = ctx.scene.spawn(
        "box",
        Transform::from_position(Vec3::new(0.0, 0.0, 2.0)),
        ColliderComponent::cuboid(Vec3::splat(0.5)),
    );
    ctx.add_camera(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    ctx.render(&RenderOptions::default());

    let hits = ctx
        .renderer
        .raycast_colliders(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 100.0);
    let nodes: Vec<NodeId> = hits.iter().map(|h| h.node).collect();
    assert_eq!(nodes, vec![boxed, sphere]);
    assert!((hits[0].distance - 2.5).abs() < 1e-4);
    assert!((hits[1].distance - 6.0).abs() < 1e-4);

    let missed = ctx
        .renderer
        .raycast_colliders(Vec3::new(5.0, 0.0, 5.0), Vec3::NEG_Z, 100.0);
    assert!(missed.is_empty());
}
