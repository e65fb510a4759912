// Literal construction for request dictionaries. The recursive-descent
// muncher below follows the shape serde_json uses for json!, reworked for
// PlistValue.

/// Construct a [`crate::plist::PlistValue`] from a JSON-like literal.
///
/// ```
/// # use remotexpc::plist;
/// #
/// let request = plist!({
///     "Label": "appium-internal",
///     "Request": "StartSession",
///     "Timeout": 30,
///     "Options": {
///         "ReturnRaw": false,
///         "Keys": ["DeviceName", "ProductVersion"],
///     },
/// });
/// ```
///
/// Interpolated variables and expressions must implement
/// `Into<PlistValue>`; keys may be any expression yielding
/// `Into<String>`. Trailing commas are accepted in both arrays and
/// dictionaries.
#[macro_export]
macro_rules! plist {
    ($($plist:tt)+) => {
        $crate::plist_internal!($($plist)+)
    };
}

#[macro_export]
#[doc(hidden)]
macro_rules! plist_internal {
    //
    // Entry points. A bare literal or expression expands directly; the
    // bracketed forms hand their contents to the recursive munchers
    // further down.
    //

    (null) => {
        $crate::plist::PlistValue::Null
    };

    (true) => {
        $crate::plist::PlistValue::Boolean(true)
    };

    (false) => {
        $crate::plist::PlistValue::Boolean(false)
    };

    ([]) => {
        $crate::plist::PlistValue::Array(vec![])
    };

    ([ $($tt:tt)+ ]) => {
        $crate::plist::PlistValue::Array($crate::plist_internal!(@array [] $($tt)+))
    };

    ({}) => {
        $crate::plist::PlistValue::Dictionary($crate::plist::Dictionary::new())
    };

    ({ $($tt:tt)+ }) => {
        $crate::plist::PlistValue::Dictionary({
            let mut dict = $crate::plist::Dictionary::new();
            $crate::plist_internal!(@dict dict () ($($tt)+) ($($tt)+));
            dict
        })
    };

    // Anything else is a single expression convertible into a value.
    ($other:expr) => {
        $crate::plist::PlistValue::from($other)
    };

    //
    // Dictionary muncher, invoked as:
    //   plist_internal!(@dict $dict () ($($tt)*) ($($tt)*))
    //
    // The parenthesized group in the middle accumulates the key tokens seen
    // so far. The trailing group is an untouched copy of the remaining
    // input: when a rule needs to reject a token it pulls the offender from
    // the copy, so the compile error points at the user's literal rather
    // than at muncher internals.
    //

    // All entries consumed.
    (@dict $dict:ident () () ()) => {};

    // Store one finished entry, then continue with whatever follows the
    // comma.
    (@dict $dict:ident [$($key:tt)+] ($value:expr) , $($rest:tt)*) => {
        let _ = $dict.insert(($($key)+), $value);
        $crate::plist_internal!(@dict $dict () ($($rest)*) ($($rest)*));
    };

    // A finished entry may only be followed by a comma or the end.
    (@dict $dict:ident [$($key:tt)+] ($value:expr) $unexpected:tt $($rest:tt)*) => {
        $crate::plist_unexpected_token!($unexpected);
    };

    // Store the final entry.
    (@dict $dict:ident [$($key:tt)+] ($value:expr)) => {
        let _ = $dict.insert(($($key)+), $value);
    };

    // With a complete key in hand, read the value. Keyword and bracketed
    // values recurse through the entry points; the finished pair is routed
    // to the storage rules above.
    (@dict $dict:ident ($($key:tt)+) (: null $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!(null)) $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: true $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!(true)) $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: false $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!(false)) $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: [$($array:tt)*] $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!([$($array)*])) $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: {$($map:tt)*} $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!({$($map)*})) $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: $value:expr , $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!($value)) , $($rest)*);
    };

    (@dict $dict:ident ($($key:tt)+) (: $value:expr) $copy:tt) => {
        $crate::plist_internal!(@dict $dict [$($key)+] ($crate::plist_internal!($value)));
    };

    // A colon with nothing after it: recurse with no arguments so the
    // error reads "unexpected end of macro invocation".
    (@dict $dict:ident ($($key:tt)+) (:) $copy:tt) => {
        $crate::plist_internal!();
    };

    // Key tokens ran out before a colon appeared.
    (@dict $dict:ident ($($key:tt)+) () $copy:tt) => {
        $crate::plist_internal!();
    };

    // A colon before any key token.
    (@dict $dict:ident () (: $($rest:tt)*) ($colon:tt $($copy:tt)*)) => {
        $crate::plist_unexpected_token!($colon);
    };

    // A comma in key position.
    (@dict $dict:ident ($($key:tt)*) (, $($rest:tt)*) ($comma:tt $($copy:tt)*)) => {
        $crate::plist_unexpected_token!($comma);
    };

    // A parenthesized key expression is taken whole.
    (@dict $dict:ident () (($key:expr) : $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict ($key) (: $($rest)*) (: $($rest)*));
    };

    // The value rules above did not fire, so whatever follows this colon
    // is not a value expression; demand one.
    (@dict $dict:ident ($($key:tt)*) (: $($unexpected:tt)+) $copy:tt) => {
        $crate::plist_expect_value_comma!($($unexpected)+);
    };

    // Otherwise the next token belongs to the key.
    (@dict $dict:ident ($($key:tt)*) ($tt:tt $($rest:tt)*) $copy:tt) => {
        $crate::plist_internal!(@dict $dict ($($key)* $tt) ($($rest)*) ($($rest)*));
    };

    //
    // Array muncher, invoked as:
    //   plist_internal!(@array [] $($tt)*)
    //
    // Finished elements accumulate inside the square brackets until the
    // input runs dry.
    //

    (@array [$($elems:expr,)*]) => {
        vec![$($elems,)*]
    };

    (@array [$($elems:expr),*]) => {
        vec![$($elems),*]
    };

    (@array [$($elems:expr,)*] null $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!(null)] $($rest)*)
    };

    (@array [$($elems:expr,)*] true $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!(true)] $($rest)*)
    };

    (@array [$($elems:expr,)*] false $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!(false)] $($rest)*)
    };

    (@array [$($elems:expr,)*] [$($array:tt)*] $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!([$($array)*])] $($rest)*)
    };

    (@array [$($elems:expr,)*] {$($map:tt)*} $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!({$($map)*})] $($rest)*)
    };

    (@array [$($elems:expr,)*] $next:expr, $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!($next),] $($rest)*)
    };

    (@array [$($elems:expr,)*] $last:expr) => {
        $crate::plist_internal!(@array [$($elems,)* $crate::plist_internal!($last)])
    };

    // Consume the separator between elements.
    (@array [$($elems:expr),*] , $($rest:tt)*) => {
        $crate::plist_internal!(@array [$($elems,)*] $($rest)*)
    };

    // Anything the element rules above could not take, e.g. two elements
    // with no comma between them.
    (@array [$($elems:expr),*] $unexpected:tt $($rest:tt)*) => {
        $crate::plist_unexpected_token!($unexpected)
    };
}

// Takes no arguments, so any use reports "no rules expected the token",
// pointing at the offending token captured by the caller.
#[macro_export]
#[doc(hidden)]
macro_rules! plist_unexpected_token {
    () => {};
}

// Matches only a value expression followed by a comma; anything else
// fails with the offending tokens in the message.
#[macro_export]
#[doc(hidden)]
macro_rules! plist_expect_value_comma {
    ($e:expr , $($tt:tt)*) => {};
}

#[cfg(test)]
mod tests {
    use crate::plist::PlistValue;

    #[test]
    fn builds_nested_request() {
        let label = "test";
        let v = crate::plist!({
            "Label": label,
            "Request": "StartSession",
            "Attempt": 2,
            "Options": {
                "Verbose": true,
                "Filters": ["a", "b", 3],
            },
        });

        let dict = v.as_dictionary().unwrap();
        assert_eq!(dict.get("Label").and_then(|x| x.as_string()), Some("test"));
        assert_eq!(
            dict.get("Attempt").and_then(|x| x.as_signed_integer()),
            Some(2)
        );
        let options = dict.get("Options").and_then(|x| x.as_dictionary()).unwrap();
        assert_eq!(
            options.get("Verbose").and_then(|x| x.as_boolean()),
            Some(true)
        );
        assert_eq!(
            options.get("Filters").and_then(|x| x.as_array()).map(|a| a.len()),
            Some(3)
        );
    }

    #[test]
    fn scalar_forms() {
        assert_eq!(crate::plist!(null), PlistValue::Null);
        assert_eq!(crate::plist!(true), PlistValue::Boolean(true));
        assert_eq!(crate::plist!("s"), PlistValue::String("s".to_string()));
        assert_eq!(crate::plist!([]), PlistValue::Array(vec![]));
    }

    #[test]
    fn computed_keys_and_values() {
        let key = format!("Key{}", 1);
        let count = 5i64;
        let v = crate::plist!({ (key.as_str()): count + 1 });
        assert_eq!(
            v.as_dictionary()
                .and_then(|d| d.get("Key1"))
                .and_then(|x| x.as_signed_integer()),
            Some(6)
        );
    }

    #[test]
    fn trailing_commas_accepted() {
        let v = crate::plist!(["one", "two",]);
        assert_eq!(v.as_array().map(|a| a.len()), Some(2));
    }
}
