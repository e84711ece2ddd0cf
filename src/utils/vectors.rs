use std::iter::Sum;

use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use serde::{Deserialize, Serialize};

/// A three-momentum $`(p_x, p_y, p_z)`$.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// The $`x`$-component.
    pub x: f64,
    /// The $`y`$-component.
    pub y: f64,
    /// The $`z`$-component.
    pub z: f64,
}

impl Vec3 {
    /// Create a new [`Vec3`] from its components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Build the three-momentum of a particle from its transverse momentum, pseudorapidity, and
    /// azimuthal angle.
    ///
    /// The longitudinal component follows from $`p_z = p_T \sinh\eta`$.
    pub fn from_pt_eta_phi(pt: f64, eta: f64, phi: f64) -> Self {
        Self {
            x: pt * phi.cos(),
            y: pt * phi.sin(),
            z: pt * eta.sinh(),
        }
    }

    /// Promote to a [`Vec4`] with the energy fixed by the given mass.
    pub fn with_mass(&self, mass: f64) -> Vec4 {
        let e = (mass * mass + self.mag2()).sqrt();
        Vec4::new(self.x, self.y, self.z, e)
    }

    /// Promote to a [`Vec4`] with the given energy.
    pub fn with_energy(&self, energy: f64) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, energy)
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
    pub fn mag2(&self) -> f64 {
        self.dot(self)
    }
    pub fn mag(&self) -> f64 {
        self.mag2().sqrt()
    }
    /// The transverse component $`\sqrt{p_x^2 + p_y^2}`$.
    pub fn pt(&self) -> f64 {
        self.x.hypot(self.y)
    }
    pub fn phi(&self) -> f64 {
        self.y.atan2(self.x)
    }
    pub fn costheta(&self) -> f64 {
        self.z / self.mag()
    }
    pub fn add(&self, other: &Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
    pub fn sub(&self, other: &Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
    pub fn mul(&self, other: f64) -> Self {
        Self::new(self.x * other, self.y * other, self.z * other)
    }
    pub fn div(&self, other: f64) -> Self {
        Self::new(self.x / other, self.y / other, self.z / other)
    }
    pub fn neg(&self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { a.add(b) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { a.sub(b) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { a.neg() });
impl_op_ex_commutative!(*|a: &Vec3, b: &f64| -> Vec3 { a.mul(*b) });
impl_op_ex!(/ |a: &Vec3, b: &f64| -> Vec3 { a.div(*b) });

/// A four-momentum $`(p_x, p_y, p_z, E)`$ with a mostly-minus metric.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl Vec4 {
    /// Create a new [`Vec4`] from its components.
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    /// Build a four-momentum from $`(p_T, \eta, \phi, m)`$, the coordinates muon records are
    /// stored in.
    pub fn from_pt_eta_phi_m(pt: f64, eta: f64, phi: f64, mass: f64) -> Self {
        Vec3::from_pt_eta_phi(pt, eta, phi).with_mass(mass)
    }

    /// The spatial part.
    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.px, self.py, self.pz)
    }
    /// The magnitude of the three-momentum, $`|\vec{p}|`$.
    pub fn p(&self) -> f64 {
        self.vec3().mag()
    }
    pub fn pt(&self) -> f64 {
        self.vec3().pt()
    }
    pub fn beta(&self) -> Vec3 {
        self.vec3().div(self.e)
    }
    pub fn gamma(&self) -> f64 {
        self.e / self.mag()
    }
    pub fn mag2(&self) -> f64 {
        self.e * self.e - self.vec3().mag2()
    }
    /// The Minkowski norm (invariant mass).
    ///
    /// Rounding can leave a nearly massless system with a tiny negative $`m^2`$, which is
    /// clamped to zero rather than producing `NaN`.
    pub fn mag(&self) -> f64 {
        self.mag2().max(0.0).sqrt()
    }
    pub fn add(&self, other: &Self) -> Self {
        Self::new(
            self.px + other.px,
            self.py + other.py,
            self.pz + other.pz,
            self.e + other.e,
        )
    }
    pub fn sub(&self, other: &Self) -> Self {
        Self::new(
            self.px - other.px,
            self.py - other.py,
            self.pz - other.pz,
            self.e - other.e,
        )
    }
    pub fn neg(&self) -> Self {
        Self::new(-self.px, -self.py, -self.pz, -self.e)
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { a.add(b) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { a.sub(b) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { a.neg() });

impl Sum for Vec4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}

impl<'a> Sum<&'a Vec4> for Vec4 {
    fn sum<I: Iterator<Item = &'a Vec4>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}

/// The invariant mass of two particles given in $`(p_T, \eta, \phi, m)`$ coordinates.
///
/// Both four-vectors are summed component-wise and the Minkowski norm of the sum is returned.
#[allow(clippy::too_many_arguments)]
pub fn mass_of_pair(
    pt1: f64,
    eta1: f64,
    phi1: f64,
    m1: f64,
    pt2: f64,
    eta2: f64,
    phi2: f64,
    m2: f64,
) -> f64 {
    let p1 = Vec4::from_pt_eta_phi_m(pt1, eta1, phi1, m1);
    let p2 = Vec4::from_pt_eta_phi_m(pt2, eta2, phi2, m2);
    (p1 + p2).mag()
}
