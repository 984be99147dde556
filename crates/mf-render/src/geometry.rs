use glam::{Quat, Vec3};

use mf_core::scene::MirrorPose;

pub const EPSILON: f32 = 1e-4;

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Mirror reflection about `normal`, starting slightly off the surface
    pub fn reflect(&self, point: Vec3, normal: Vec3) -> Ray {
        let direction = self.direction - normal * (2.0 * self.direction.dot(normal));
        Ray::new(point + normal * EPSILON * 10.0, direction.normalize())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Hit {
    pub t: f32,
    pub normal: Vec3,
}

pub fn intersect_sphere(ray: &Ray, center: Vec3, radius: f32) -> Option<Hit> {
    let oc = ray.origin - center;
    let b = oc.dot(ray.direction);
    let c = oc.length_squared() - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let sqrt = disc.sqrt();
    let t = if -b - sqrt > EPSILON { -b - sqrt } else { -b + sqrt };
    if t <= EPSILON {
        return None;
    }
    Some(Hit {
        t,
        normal: (ray.at(t) - center) / radius,
    })
}

/// Box with half extents `half`, centered at `center`, rotated by `yaw` about +Y
pub fn intersect_box(ray: &Ray, center: Vec3, half: Vec3, yaw: f32) -> Option<Hit> {
    let rotation = Quat::from_rotation_y(yaw);
    let inverse = rotation.inverse();
    let origin = inverse * (ray.origin - center);
    let direction = inverse * ray.direction;

    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    let mut axis_near = 0;
    let mut axis_far = 0;
    for axis in 0..3 {
        let (o, d, h) = (origin[axis], direction[axis], half[axis]);
        if d.abs() < 1e-8 {
            if o.abs() > h {
                return None;
            }
            continue;
        }
        let (mut t0, mut t1) = ((-h - o) / d, (h - o) / d);
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        if t0 > t_near {
            t_near = t0;
            axis_near = axis;
        }
        if t1 < t_far {
            t_far = t1;
            axis_far = axis;
        }
        if t_near > t_far {
            return None;
        }
    }

    let (t, axis) = if t_near > EPSILON {
        (t_near, axis_near)
    } else if t_far > EPSILON {
        (t_far, axis_far)
    } else {
        return None;
    };

    let local_point = origin + direction * t;
    let mut local_normal = Vec3::ZERO;
    local_normal[axis] = local_point[axis].signum();
    Some(Hit {
        t,
        normal: rotation * local_normal,
    })
}

/// Finite floor on `y = 0`
pub fn intersect_floor(ray: &Ray, extent: f32) -> Option<Hit> {
    if ray.direction.y.abs() < 1e-8 {
        return None;
    }
    let t = -ray.origin.y / ray.direction.y;
    if t <= EPSILON {
        return None;
    }
    let p = ray.at(t);
    if p.x.abs() > extent || p.z.abs() > extent {
        return None;
    }
    Some(Hit {
        t,
        normal: if ray.origin.y >= 0.0 { Vec3::Y } else { -Vec3::Y },
    })
}

/// Mirror rectangle. `front` tells whether the reflective side was hit.
pub fn intersect_mirror(ray: &Ray, mirror: &MirrorPose) -> Option<(Hit, bool)> {
    let normal = mirror.normal.normalize_or_zero();
    let denom = ray.direction.dot(normal);
    if denom.abs() < 1e-8 {
        return None;
    }
    let t = (mirror.center - ray.origin).dot(normal) / denom;
    if t <= EPSILON {
        return None;
    }
    let local = ray.at(t) - mirror.center;
    let (right, up) = mirror.axes();
    if local.dot(right).abs() > mirror.width * 0.5 || local.dot(up).abs() > mirror.height * 0.5 {
        return None;
    }
    let front = denom < 0.0;
    Some((
        Hit {
            t,
            normal: if front { normal } else { -normal },
        },
        front,
    ))
}
