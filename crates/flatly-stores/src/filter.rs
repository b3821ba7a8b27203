//! Pure filter/sort over listing collections. Filter values come straight
//! from form fields, so numeric bounds are strings parsed permissively:
//! empty or unparsable text means "no bound".

use flatly_types::models::Flat;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatFilters {
    pub city: String,
    pub min_price: String,
    pub max_price: String,
    pub min_area: String,
    pub max_area: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    City,
    RentPrice,
    AreaSize,
    YearBuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

fn bound(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// Case-insensitive substring search over name, city, and street name, plus
/// independent inclusive range checks. Empty inputs skip their predicate.
pub fn apply_filters(flats: &[Flat], filters: &FlatFilters, search: &str) -> Vec<Flat> {
    let search = search.trim().to_lowercase();
    let city = filters.city.trim().to_lowercase();
    let min_price = bound(&filters.min_price);
    let max_price = bound(&filters.max_price);
    let min_area = bound(&filters.min_area);
    let max_area = bound(&filters.max_area);

    flats
        .iter()
        .filter(|flat| {
            if !search.is_empty() {
                let hit = flat.name.to_lowercase().contains(&search)
                    || flat.city.to_lowercase().contains(&search)
                    || flat.street_name.to_lowercase().contains(&search);
                if !hit {
                    return false;
                }
            }
            if !city.is_empty() && !flat.city.to_lowercase().contains(&city) {
                return false;
            }
            if min_price.is_some_and(|min| flat.rent_price < min) {
                return false;
            }
            if max_price.is_some_and(|max| flat.rent_price > max) {
                return false;
            }
            if min_area.is_some_and(|min| flat.area_size < min) {
                return false;
            }
            if max_area.is_some_and(|max| flat.area_size > max) {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

/// Comparator switch: lexicographic for the city key, numeric otherwise,
/// with direction flip.
pub fn sort_flats(flats: &[Flat], key: SortKey, direction: SortDirection) -> Vec<Flat> {
    let mut sorted = flats.to_vec();
    sorted.sort_by(|a, b| {
        let ord = match key {
            SortKey::City => a.city.cmp(&b.city),
            SortKey::RentPrice => a
                .rent_price
                .partial_cmp(&b.rent_price)
                .unwrap_or(std::cmp::Ordering::Equal),
            SortKey::AreaSize => a
                .area_size
                .partial_cmp(&b.area_size)
                .unwrap_or(std::cmp::Ordering::Equal),
            SortKey::YearBuilt => a.year_built.cmp(&b.year_built),
        };
        match direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
    sorted
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn flat(name: &str, city: &str, rent: f64, area: f64, year: i32) -> Flat {
        Flat {
            id: Uuid::new_v4(),
            name: name.into(),
            city: city.into(),
            street_name: "Hauptstrasse".into(),
            street_number: 1,
            area_size: area,
            rent_price: rent,
            year_built: year,
            has_ac: false,
            image_url: None,
            owner_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn sample() -> Vec<Flat> {
        vec![
            flat("Old town studio", "Linz", 500.0, 38.0, 1960),
            flat("Riverside loft", "Graz", 900.0, 72.0, 2005),
            flat("Garden flat", "Linz", 650.0, 55.0, 1988),
        ]
    }

    #[test]
    fn min_price_keeps_only_expensive_listings() {
        let flats = sample();
        let filters = FlatFilters { min_price: "600".into(), ..Default::default() };

        let result = apply_filters(&flats, &filters, "");
        let cities: Vec<&str> = result.iter().map(|f| f.city.as_str()).collect();
        assert_eq!(cities, ["Graz", "Linz"]);
    }

    #[test]
    fn search_is_case_insensitive_across_fields() {
        let flats = sample();
        let filters = FlatFilters::default();

        assert_eq!(apply_filters(&flats, &filters, "LOFT").len(), 1);
        assert_eq!(apply_filters(&flats, &filters, "linz").len(), 2);
        assert_eq!(apply_filters(&flats, &filters, "hauptstr").len(), 3);
        assert!(apply_filters(&flats, &filters, "vienna").is_empty());
    }

    #[test]
    fn empty_and_junk_bounds_are_no_ops() {
        let flats = sample();
        let filters = FlatFilters {
            min_price: "   ".into(),
            max_price: "cheap".into(),
            ..Default::default()
        };
        assert_eq!(apply_filters(&flats, &filters, "").len(), flats.len());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let flats = sample();
        let filters = FlatFilters {
            min_price: "500".into(),
            max_price: "650".into(),
            ..Default::default()
        };
        assert_eq!(apply_filters(&flats, &filters, "").len(), 2);
    }

    #[test]
    fn filtering_is_idempotent() {
        let flats = sample();
        let filters = FlatFilters {
            city: "linz".into(),
            max_area: "60".into(),
            ..Default::default()
        };

        let once = apply_filters(&flats, &filters, "flat");
        let twice = apply_filters(&once, &filters, "flat");
        assert_eq!(once, twice);
    }

    #[test]
    fn sort_desc_reverses_sort_asc() {
        // Distinct keys throughout; with ties a stable sort keeps input
        // order in both directions, so reversal only holds key-wise.
        let flats = vec![
            flat("a", "Linz", 500.0, 38.0, 1960),
            flat("b", "Graz", 900.0, 72.0, 2005),
            flat("c", "Wels", 650.0, 55.0, 1988),
        ];
        for key in [SortKey::City, SortKey::RentPrice, SortKey::AreaSize, SortKey::YearBuilt] {
            let asc = sort_flats(&flats, key, SortDirection::Asc);
            let desc = sort_flats(&asc, key, SortDirection::Desc);
            let mut reversed = asc.clone();
            reversed.reverse();
            assert_eq!(desc, reversed);
        }
    }

    #[test]
    fn sorts_by_numeric_value_not_string() {
        let flats = vec![
            flat("a", "Linz", 1000.0, 30.0, 2000),
            flat("b", "Linz", 200.0, 30.0, 2000),
        ];
        let sorted = sort_flats(&flats, SortKey::RentPrice, SortDirection::Asc);
        assert_eq!(sorted[0].rent_price, 200.0);
    }
}
