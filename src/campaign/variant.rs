//! A/B variant assignment.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::store::{ContactId, Variant};

/// Minimum eligible contacts before the variant-B floor applies.
pub const FLOOR_MIN_ELIGIBLE: usize = 100;

/// Minimum variant-B members once the floor applies.
pub const FLOOR_VARIANT_B: usize = 50;

/// Assigns message variants to newly enrolled contacts.
///
/// Only contacts without a membership are passed in; existing memberships
/// keep the variant they were created with.
#[derive(Debug, Clone, Copy)]
pub struct VariantAssigner {
    split_percent: u8,
    has_template_b: bool,
    apply_floor: bool,
}

impl VariantAssigner {
    pub fn new(split_percent: u8, has_template_b: bool) -> Self {
        Self {
            split_percent: split_percent.min(100),
            has_template_b,
            apply_floor: true,
        }
    }

    /// Disable the small-sample floor (once any message has gone out).
    pub fn without_floor(mut self) -> Self {
        self.apply_floor = false;
        self
    }

    /// Draw a variant for each contact.
    pub fn assign<R: Rng + ?Sized>(&self, contacts: &[ContactId], rng: &mut R) -> Vec<(ContactId, Variant)> {
        if !self.has_template_b {
            return contacts.iter().map(|&c| (c, Variant::A)).collect();
        }

        let p = f64::from(self.split_percent) / 100.0;
        let mut assigned: Vec<(ContactId, Variant)> = contacts
            .iter()
            .map(|&c| {
                let v = if rng.gen_bool(p) { Variant::B } else { Variant::A };
                (c, v)
            })
            .collect();

        if self.apply_floor && contacts.len() >= FLOOR_MIN_ELIGIBLE {
            let b_count = assigned.iter().filter(|(_, v)| *v == Variant::B).count();
            if b_count < FLOOR_VARIANT_B {
                let mut a_slots: Vec<usize> = assigned
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, v))| *v == Variant::A)
                    .map(|(i, _)| i)
                    .collect();
                a_slots.shuffle(rng);
                for i in a_slots.into_iter().take(FLOOR_VARIANT_B - b_count) {
                    assigned[i].1 = Variant::B;
                }
            }
        }

        assigned
    }
}
